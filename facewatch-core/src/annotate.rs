//! Track overlays for preview frames.

use crate::recognition::TrackMatch;
use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};

const KNOWN: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN: Rgb<u8> = Rgb([255, 0, 0]);
/// Tracks not refreshed by the current frame
const STALE: Rgb<u8> = Rgb([255, 200, 0]);

/// Copy of `frame` with one box per track: green when matched, red when
/// unknown, amber when the track was not seen in this frame.
pub fn draw_tracks(frame: &RgbImage, matches: &[TrackMatch]) -> RgbImage {
    let mut canvas = frame.clone();

    for track_match in matches {
        let color = if track_match.age > 0 {
            STALE
        } else if track_match.outcome.label.is_known() {
            KNOWN
        } else {
            UNKNOWN
        };

        let bbox = &track_match.detection.bbox;
        let (width, height) = (bbox.width().max(1) as u32, bbox.height().max(1) as u32);
        draw_hollow_rect_mut(&mut canvas, Rect::at(bbox.x1, bbox.y1).of_size(width, height), color);
        if width > 2 && height > 2 {
            let inner = Rect::at(bbox.x1 + 1, bbox.y1 + 1).of_size(width - 2, height - 2);
            draw_hollow_rect_mut(&mut canvas, inner, color);
        }
        draw_cross_mut(
            &mut canvas,
            color,
            bbox.x1 + bbox.width() / 2,
            bbox.y1 + bbox.height() / 2,
        );
    }

    canvas
}

/// Timestamped file name for a saved frame
pub fn frame_filename(prefix: &str, index: u64) -> String {
    format!(
        "{}_{}_{:05}.jpg",
        prefix,
        Local::now().format("%Y%m%d_%H%M%S"),
        index
    )
}

/// Draw `matches` on `frame` and write the result into `dir`
pub fn save_annotated(
    frame: &RgbImage,
    matches: &[TrackMatch],
    dir: &Path,
    index: u64,
) -> Result<PathBuf, image::ImageError> {
    let path = dir.join(frame_filename("preview", index));
    draw_tracks(frame, matches).save(&path)?;
    log::debug!("Preview frame saved to {}", path.display());
    Ok(path)
}

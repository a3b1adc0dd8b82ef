use crate::detect::Landmarks;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// Edge length of the aligned face crop expected by ArcFace
pub const ALIGNED_SIZE: u32 = 112;

/// Reference keypoint positions inside the 112x112 ArcFace crop
pub const REFERENCE_LANDMARKS: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `u = a*x - b*y + tx`, `v = b*x + a*y + ty`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    /// `None` if the source points collapse onto one location.
    pub fn fit(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let (sx, sy) = src.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        let (dx, dy) = dst.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        let (mx, my) = (sx / n, sy / n);
        let (mu, mv) = (dx / n, dy / n);

        let mut spread = 0.0;
        let mut cos_term = 0.0;
        let mut sin_term = 0.0;
        for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
            let (x, y) = (x - mx, y - my);
            let (u, v) = (u - mu, v - mv);
            spread += x * x + y * y;
            cos_term += x * u + y * v;
            sin_term += x * v - y * u;
        }

        if spread < 1e-6 {
            return None;
        }

        let a = cos_term / spread;
        let b = sin_term / spread;
        Some(Self {
            a,
            b,
            tx: mu - (a * mx - b * my),
            ty: mv - (b * mx + a * my),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn projection(&self) -> Option<Projection> {
        Projection::from_matrix([
            self.a, -self.b, self.tx, //
            self.b, self.a, self.ty, //
            0.0, 0.0, 1.0,
        ])
    }
}

/// Warp the face described by `landmarks` into a 112x112 canonical crop.
/// Returns `None` when no usable transform exists.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks) -> Option<RgbImage> {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS)?;
    let projection = transform.projection()?;

    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut aligned,
    );
    Some(aligned)
}

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use facewatch_core::{config::Config, service::RecognizedFace, Error, FaceWatch};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "facewatch")]
#[command(about = "Live face tracking and identification", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: system, then user, then built-in)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from the camera or an image file
    Add {
        /// Display name of the person
        name: String,
        /// Enroll from this image instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Remove an enrolled person
    Remove {
        /// Identity key as shown by `list`
        key: String,
    },
    /// List enrolled people
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Recognize faces and print each newly seen person
    Run {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Print one JSON object per result, with the face crop in base64
        #[arg(long)]
        json: bool,
    },
    /// Save annotated frames showing live tracks
    Preview {
        /// Number of frames to process
        #[arg(short, long, default_value_t = 100)]
        frames: u64,
        /// Save every Nth processed frame
        #[arg(short, long, default_value_t = 10)]
        every: u64,
    },
    /// Capture a snapshot from the camera
    Snapshot {
        /// Output file path
        output: PathBuf,
    },
    /// Export the stored face image of an enrolled person
    FaceImage {
        /// Identity key as shown by `list`
        key: String,
        /// Output file path; prints base64 when omitted
        output: Option<PathBuf>,
    },
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .init();

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load_from_path(path)?;
            config.validate()?;
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Add { name, image } => cmd_add(config, name, image),
        Commands::Remove { key } => cmd_remove(config, key),
        Commands::List { json } => cmd_list(config, json),
        Commands::Run { duration, json } => cmd_run(config, duration, json),
        Commands::Preview { frames, every } => cmd_preview(config, frames, every),
        Commands::Snapshot { output } => cmd_snapshot(config, output),
        Commands::FaceImage { key, output } => cmd_face_image(config, key, output),
        Commands::Config { validate } => cmd_config(config, validate),
    }
}

fn cmd_add(config: Config, name: String, image: Option<PathBuf>) -> anyhow::Result<()> {
    let service = FaceWatch::new(config);

    let enrollment = match image {
        Some(path) => {
            println!("Enrolling {} from {}", name, path.display());
            let bytes = std::fs::read(&path)?;
            service.try_enroll_image(&name, &bytes)?
        }
        None => {
            println!("Enrolling {}", name);
            println!("\nLook at the camera...");
            service.try_enroll(&name)?
        }
    };

    println!(
        "\n✓ Added {} face samples for {}",
        enrollment.sample_count, enrollment.display_name
    );
    println!("Identity key: {}", enrollment.key);
    Ok(())
}

fn cmd_remove(config: Config, key: String) -> anyhow::Result<()> {
    let service = FaceWatch::new(config);
    let removed = service.remove_identity(&key)?;
    println!(
        "✓ Removed {} ({} samples)",
        removed.display_name,
        removed.samples.len()
    );
    Ok(())
}

fn cmd_list(config: Config, json: bool) -> anyhow::Result<()> {
    let service = FaceWatch::new(config);
    let identities = service.list_identities()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&identities)?);
        return Ok(());
    }

    if identities.is_empty() {
        println!("No one enrolled yet");
        return Ok(());
    }

    println!("{:<20} {:<25} {}", "Key", "Name", "Samples");
    println!("{}", "-".repeat(55));
    for identity in identities {
        println!(
            "{:<20} {:<25} {}",
            identity.key, identity.display_name, identity.sample_count
        );
    }
    Ok(())
}

fn cmd_run(config: Config, duration: Option<u64>, json: bool) -> anyhow::Result<()> {
    let service = FaceWatch::new(config);
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));

    service.start()?;
    if !json {
        println!("Watching for faces (Ctrl+C to quit)...");
    }

    while service.is_running() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            match service.stop() {
                Ok(()) | Err(Error::NotRunning) => {}
                Err(e) => return Err(e.into()),
            }
            break;
        }

        if let Some(face) = service.wait_result(Duration::from_millis(500)) {
            print_face(&face, json)?;
        }
    }

    let stopped_early = deadline.map_or(true, |d| Instant::now() < d);
    service.join();
    if stopped_early {
        anyhow::bail!("Recognition stopped unexpectedly; run with --verbose for details");
    }
    Ok(())
}

fn print_face(face: &RecognizedFace, json: bool) -> anyhow::Result<()> {
    if json {
        let record = serde_json::json!({
            "name": face.name,
            "confidence": face.confidence,
            "timestamp": face.timestamp.to_rfc3339(),
            "track_id": face.track_id,
            "image": face.image.as_ref().map(|jpeg| STANDARD.encode(jpeg)),
        });
        println!("{}", serde_json::to_string(&record)?);
    } else {
        println!(
            "{}  {:<25} {:.2}",
            face.timestamp
                .with_timezone(&chrono::Local)
                .format("%H:%M:%S"),
            face.name,
            face.confidence
        );
    }
    Ok(())
}

fn cmd_preview(config: Config, frames: u64, every: u64) -> anyhow::Result<()> {
    let service = FaceWatch::new(config);
    let summary = service.preview(frames, every)?;

    println!(
        "✓ Processed {} frames, saved {} to {}",
        summary.frames,
        summary.saved.len(),
        service.config().debug.output_dir.display()
    );
    if !summary.recognized.is_empty() {
        let names: Vec<&str> = summary.recognized.iter().map(String::as_str).collect();
        println!("Recognized: {}", names.join(", "));
    }
    Ok(())
}

fn cmd_snapshot(config: Config, output: PathBuf) -> anyhow::Result<()> {
    println!("Capturing snapshot to: {}", output.display());

    let service = FaceWatch::new(config);
    let jpeg = service.snapshot()?;
    std::fs::write(&output, &jpeg)?;

    println!("✓ Snapshot saved: {}", output.display());
    Ok(())
}

fn cmd_face_image(config: Config, key: String, output: Option<PathBuf>) -> anyhow::Result<()> {
    let service = FaceWatch::new(config);
    let bytes = service.identity_image(&key)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &bytes)?;
            println!("✓ Face image saved: {}", path.display());
        }
        None => println!("{}", STANDARD.encode(&bytes)),
    }
    Ok(())
}

fn cmd_config(config: Config, validate: bool) -> anyhow::Result<()> {
    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

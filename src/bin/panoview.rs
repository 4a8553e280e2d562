//! panoview - panomersive viewer core driver
//!
//! Subcommands:
//! 1. `probe`: discover a camera's faces and print them
//! 2. `replay`: run the full pipeline against synthetic `stub://` faces
//! 3. `fixed`: load still faces from a directory and render them once

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use panoview::discovery::{EncoderConfiguration, StaticMediaConfig};
use panoview::{
    classify, CameraConnection, DeviceProtocolClient, Face, NavigationCommand, SessionManager,
    StreamDescriptor, StubEngine, SyntheticDecoderFactory, ViewKind, ViewerConfig,
};

const REPLAY_FACES: [Face; 6] = [
    Face::Front,
    Face::Left,
    Face::Back,
    Face::Right,
    Face::Up,
    Face::Down,
];

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover a camera's face streams and print them.
    Probe {
        /// Camera name or address from the configuration file.
        #[arg(long, conflicts_with = "ip")]
        camera: Option<String>,
        /// Camera address (ad hoc, not from configuration).
        #[arg(long)]
        ip: Option<String>,
        #[arg(long, env = "PANOVIEW_USERNAME", default_value = "")]
        username: String,
        #[arg(long, env = "PANOVIEW_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,
        /// Request the high-resolution immersive stream instead of the mosaic.
        #[arg(long)]
        high_res: bool,
        /// Encoder resolution as NAME=WIDTHxHEIGHT; skips the media-service query.
        #[arg(long = "encoder", value_name = "NAME=WxH")]
        encoders: Vec<String>,
    },
    /// Run the pipeline against synthetic faces.
    Replay {
        #[arg(long, default_value_t = 4)]
        faces: usize,
        #[arg(long, default_value_t = 320)]
        width: u32,
        #[arg(long, default_value_t = 240)]
        height: u32,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Load still faces (negx.jpg + negx_layout.txt, ...) and render them.
    Fixed {
        #[arg(long)]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = ViewerConfig::load()?;

    match args.command {
        Command::Probe {
            camera,
            ip,
            username,
            password,
            high_res,
            encoders,
        } => {
            let camera = match (camera, ip) {
                (Some(key), _) => config
                    .find_camera(&key)
                    .cloned()
                    .ok_or_else(|| anyhow!("camera '{}' is not configured", key))?,
                (None, Some(ip)) => CameraConnection {
                    name: ip.clone(),
                    ip_address: ip,
                    username,
                    password,
                    use_high_res_stream: high_res,
                },
                (None, None) => return Err(anyhow!("either --camera or --ip is required")),
            };
            probe(&config, &camera, &encoders)
        }
        Command::Replay {
            faces,
            width,
            height,
            fps,
            seconds,
        } => replay(config, faces, width, height, fps, Duration::from_secs(seconds)),
        Command::Fixed { dir } => fixed(config, dir),
    }
}

fn probe(config: &ViewerConfig, camera: &CameraConnection, encoders: &[String]) -> Result<()> {
    let client = if encoders.is_empty() {
        DeviceProtocolClient::onvif(config.discovery_timeout())?
    } else {
        let configurations = encoders
            .iter()
            .map(|spec| {
                EncoderConfiguration::parse_spec(spec)
                    .ok_or_else(|| anyhow!("invalid --encoder '{}', expected NAME=WxH", spec))
            })
            .collect::<Result<Vec<_>>>()?;
        DeviceProtocolClient::new(Box::new(StaticMediaConfig::new(configurations)))
            .with_timeout(config.discovery_timeout())
    };
    let client = client.with_rtsp_port(config.rtsp_port);

    let (camera_type, streams) = client
        .discover(camera)
        .with_context(|| format!("probe {}", camera.ip_address))?;
    println!("camera {} ({}): {:?}", camera.name, camera.ip_address, camera_type);
    for stream in &streams {
        println!(
            "  {:<7} {:>5}x{:<5} {}  layout={}",
            stream.face, stream.width, stream.height, stream.endpoint, stream.layout_metadata
        );
    }
    Ok(())
}

fn replay(
    config: ViewerConfig,
    faces: usize,
    width: u32,
    height: u32,
    fps: u32,
    duration: Duration,
) -> Result<()> {
    if faces == 0 || faces > REPLAY_FACES.len() {
        return Err(anyhow!("--faces must be between 1 and {}", REPLAY_FACES.len()));
    }
    let streams: Vec<StreamDescriptor> = REPLAY_FACES[..faces]
        .iter()
        .map(|face| StreamDescriptor {
            face: *face,
            endpoint: format!("stub://{face}?width={width}&height={height}&fps={fps}"),
            layout_metadata: format!("{face}:0,0,{width},{height}"),
            width,
            height,
        })
        .collect();
    let resolutions: Vec<(u32, u32)> = streams.iter().map(|s| s.resolution()).collect();
    let camera_type = classify(&resolutions);
    log::info!("replaying {} synthetic face(s) as {:?}", faces, camera_type);

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || running_handler.store(false, Ordering::SeqCst))
        .context("error setting Ctrl-C handler")?;

    let mut manager = SessionManager::new(StubEngine::new(), config);
    manager.load_streams(camera_type, streams, &SyntheticDecoderFactory::default())?;

    let started = Instant::now();
    let mut next_report = started + Duration::from_secs(1);
    while running.load(Ordering::SeqCst) && started.elapsed() < duration {
        std::thread::sleep(Duration::from_millis(50));
        if Instant::now() >= next_report {
            log::info!("fps: {}", manager.fps().latest());
            next_report += Duration::from_secs(1);
        }
    }

    let stats: Vec<(Face, u64, u64)> = manager
        .sessions()
        .iter()
        .map(|s| {
            let stats = s.stats();
            (s.face(), stats.frames_displayed, stats.frames_discarded)
        })
        .collect();
    manager.shutdown();

    println!(
        "composed {} render(s) in {:.1}s",
        manager.fps().total(),
        started.elapsed().as_secs_f32()
    );
    for (face, displayed, discarded) in stats {
        println!("  {:<7} displayed={} discarded={}", face, displayed, discarded);
    }
    Ok(())
}

fn fixed(config: ViewerConfig, dir: PathBuf) -> Result<()> {
    let mut manager = SessionManager::new(StubEngine::new(), config);
    let camera_type = manager.load_fixed(&dir)?;
    println!("{}: {:?}", dir.display(), camera_type);
    for session in manager.sessions() {
        println!(
            "  {:<7} {:>5}x{:<5} layout={}",
            session.face(),
            session.width(),
            session.height(),
            session.layout_metadata().trim()
        );
    }

    manager.send(NavigationCommand::Refresh)?;
    std::thread::sleep(Duration::from_millis(100));
    manager.shutdown();

    if let Some(engine) = manager.engine() {
        println!(
            "rendered immersive x{}, panoramic x{}",
            engine.render_count(ViewKind::Immersive),
            engine.render_count(ViewKind::Panoramic)
        );
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gstreamer as gst;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mixel::app::App;
use mixel::defines::{APP_NAME, APP_VERSION};
use mixel::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = APP_VERSION, disable_help_flag = true, disable_version_flag = true)]
#[command(about = "Media-processing core of a real-time live video mixer")]
struct CliArgs {
    /// Print help
    #[arg(long = "help", short = 'H', action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Print version
    #[arg(long = "version", short = 'V', default_value_t = false)]
    version: bool,

    /// Check the media backend and exit
    #[arg(long = "test", short = 'T', default_value_t = false)]
    test: bool,

    /// Reset user settings to defaults
    #[arg(long = "clean", short = 'C', default_value_t = false)]
    clean: bool,

    /// Run without a window
    #[arg(long = "headless", short = 'L', default_value_t = false)]
    headless: bool,

    /// Use an alternative settings file
    #[arg(long = "settings", short = 'S')]
    settings: Option<PathBuf>,

    /// Interface font size (used by the GUI layer)
    #[arg(long = "fontsize", short = 'F')]
    fontsize: Option<u32>,

    /// Session file to open
    session: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();

    if args.version {
        println!("{} {}", APP_NAME, APP_VERSION);
        std::process::exit(0);
    }

    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            error!(error = %format!("{:#}", e), "Initialization failed");
            std::process::exit(1);
        }
    }
}

async fn run(args: CliArgs) -> Result<()> {
    gst::init()?;

    if args.test {
        println!(
            "{} {} with GStreamer {}",
            APP_NAME,
            APP_VERSION,
            gst::version_string()
        );
        return Ok(());
    }

    let settings_path = args.settings.clone().unwrap_or_else(Settings::default_path);

    if args.clean && settings_path.exists() {
        std::fs::remove_file(&settings_path)?;
        info!(path = %settings_path.display(), "User settings reset");
    }

    let settings = Settings::load(&settings_path)?;
    if let Some(size) = args.fontsize {
        // the GUI layer reads this at startup; nothing to apply headless
        info!(size, "Font size requested");
    }

    let mut app = App::new(settings, settings_path);
    app.init()?;

    // open the requested session, or the last one used
    let session_file = args
        .session
        .clone()
        .or_else(|| app.settings.last_session.as_ref().map(PathBuf::from))
        .filter(|p| p.exists());
    if let Some(path) = session_file {
        if let Err(e) = app.open_session(&path) {
            error!(path = %path.display(), error = %format!("{:#}", e), "Failed to open session");
        }
    }

    if args.headless {
        info!("Running headless");
    }

    // ctrl-c requests a clean shutdown
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            stop.store(true, Ordering::Release);
        });
    }

    // the render loop owns the app; one tick per display frame
    tokio::task::spawn_blocking(move || {
        while !stop.load(Ordering::Acquire) {
            let frame_start = std::time::Instant::now();
            app.tick();
            let budget = Duration::from_millis(33);
            let spent = frame_start.elapsed();
            if spent < budget {
                std::thread::sleep(budget - spent);
            }
        }
        app.terminate();
    })
    .await?;

    Ok(())
}

use anyhow::{Context, Result, anyhow};
use camcast::assets::{
    DEFAULT_RUNTIME, DEFAULT_STREAM_HOST, DEFAULT_STREAM_PORT, HEALTH_REPORT_INTERVAL_SECS, TARGET_OS,
};
use camcast::config::{ControllerConfig, PipelineProfile, app_name, version};
use camcast::pipeline::{
    ControlRequests, DeviceSelector, PipelineController, PipelineState, RuntimeEvent, SurfaceHandle,
};
#[cfg(feature = "gstreamer")]
use camcast::runtime::GstRuntime;
use camcast::runtime::{MediaRuntime, SoftRuntime};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{error, info, warn};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

enum Step {
    Quit,
    Switch,
    Report,
    Event(Option<RuntimeEvent>),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("PATH")
                .help("Capture device to open (defaults to the first one available)."),
        )
        .arg(
            Arg::new("runtime")
                .short('r')
                .long("runtime")
                .value_name("NAME")
                .help("Media runtime: gstreamer (real devices) or soft (built-in simulation).")
                .value_parser(["gstreamer", "soft"])
                .default_value(DEFAULT_RUNTIME),
        )
        .arg(
            Arg::new("profile")
                .short('p')
                .long("profile")
                .value_name("NAME|FILE")
                .help("Built-in profile (webcam-display, webcam-stream, webcam-display-stream) or a JSON profile file.")
                .default_value("webcam-display"),
        )
        .arg(
            Arg::new("stream")
                .short('s')
                .long("stream")
                .help("Re-stream the capture over TCP instead of only showing it.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .help("Address the stream server binds to."),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Port the stream server listens on.")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Controller configuration (JSON)."),
        )
        .arg(
            Arg::new("window-id")
                .long("window-id")
                .value_name("ID")
                .help("Native window to render into (the video sink opens its own otherwise).")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("switch-to")
                .long("switch-to")
                .value_name("PATH")
                .help("Switch to this capture device while running."),
        )
        .arg(
            Arg::new("switch-after")
                .long("switch-after")
                .value_name("SECONDS")
                .help("Delay before --switch-to takes effect.")
                .value_parser(value_parser!(u64))
                .default_value("5"),
        )
        .arg(
            Arg::new("run-for")
                .long("run-for")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for Ctrl-C.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("list-devices")
                .short('l')
                .long("list-devices")
                .help("Print the available capture devices and exit.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => ControllerConfig::from_json_file(path)?,
        None => ControllerConfig::default(),
    };

    match matches.get_one::<String>("runtime").map(String::as_str) {
        Some("soft") => {
            let runtime = SoftRuntime::new().context("failed to start the software runtime")?;
            launch(runtime, config, &matches)
        }
        #[cfg(feature = "gstreamer")]
        Some("gstreamer") => {
            let runtime = GstRuntime::new().context("failed to initialize GStreamer")?;
            launch(runtime, config, &matches)
        }
        Some(other) => Err(anyhow!("runtime '{}' is not available in this build", other)),
        None => Err(anyhow!("no media runtime selected")),
    }
}

fn launch<R: MediaRuntime>(runtime: R, mut config: ControllerConfig, matches: &ArgMatches) -> Result<()> {
    let window = matches.get_one::<u64>("window-id").copied().and_then(SurfaceHandle::from_raw);
    if window.is_none() {
        config.require_surface_for_display = false;
    }
    let mut controller = PipelineController::new(runtime, config);

    let devices = controller.available_devices()?;
    if matches.get_flag("list-devices") {
        for device in &devices {
            println!("{}", device);
        }
        return Ok(());
    }

    let device = match matches.get_one::<String>("device") {
        Some(device) => device.clone(),
        None => devices
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no capture device available"))?,
    };

    let host = matches
        .get_one::<String>("host")
        .map(String::as_str)
        .unwrap_or(DEFAULT_STREAM_HOST);
    let port = matches.get_one::<u16>("port").copied().unwrap_or(DEFAULT_STREAM_PORT);

    let profile = if matches.get_flag("stream") {
        PipelineProfile::webcam_stream(&device, host, port)
    } else {
        let name = matches
            .get_one::<String>("profile")
            .map(String::as_str)
            .unwrap_or("webcam-display");
        match PipelineProfile::builtin(name, &device) {
            Some(profile) => profile,
            None if Path::new(name).exists() => PipelineProfile::load(name)?,
            None => return Err(anyhow!("unknown profile '{}'", name)),
        }
    };

    let switch = matches.get_one::<String>("switch-to").cloned().map(|target| {
        let after = matches.get_one::<u64>("switch-after").copied().unwrap_or(5);
        (target, Duration::from_secs(after))
    });
    let run_for = matches.get_one::<u64>("run-for").copied().map(Duration::from_secs);

    // gracefully close the shell when receiving SIGINT, SIGTERM, or SIGHUP
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || token.cancel()).context("Error setting Ctrl-C handler")?;

    info!("{} {} starting on {}", app_name(), version(), TARGET_OS);

    let workers = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = workers.block_on(run(&mut controller, &profile, window, switch, run_for, shutdown));

    controller.teardown();
    info!("{}", controller.health().summary());
    result
}

/// Presentation shell loop: what a windowed front end would do, minus its own window
async fn run<R: MediaRuntime>(
    controller: &mut PipelineController<R>,
    profile: &PipelineProfile,
    window: Option<SurfaceHandle>,
    mut switch: Option<(String, Duration)>,
    run_for: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<()> {
    controller.register(|event: &RuntimeEvent, requests: &mut ControlRequests| match event {
        RuntimeEvent::Error { .. } if event.is_fatal() => {
            error!("{}", event);
            warn!("reverting to home view");
            requests.teardown();
        }
        RuntimeEvent::Error { .. } => warn!("{}", event),
        _ => info!("{}", event),
    });

    controller.build_profile(profile)?;
    controller.request_transition(PipelineState::Ready)?;

    if let Some(surface) = window
        && controller.graph().is_some_and(|g| !g.display_sinks().is_empty())
    {
        controller.attach(surface)?;
    }
    controller.request_transition(PipelineState::Playing)?;
    info!("playing '{}' from {}", profile.name, controller.device().unwrap_or("test source"));

    let started = Instant::now();
    let stop_at = started + run_for.unwrap_or_default();
    let switch_at = started + switch.as_ref().map(|(_, after)| *after).unwrap_or_default();
    let mut report = tokio::time::interval(Duration::from_secs(HEALTH_REPORT_INTERVAL_SECS));
    report.tick().await;

    loop {
        let step = tokio::select! {
            _ = shutdown.cancelled() => Step::Quit,
            _ = tokio::time::sleep_until(stop_at), if run_for.is_some() => Step::Quit,
            _ = tokio::time::sleep_until(switch_at), if switch.is_some() => Step::Switch,
            _ = report.tick() => Step::Report,
            event = controller.next_event() => Step::Event(event),
        };

        match step {
            Step::Quit => {
                info!("shutting down");
                break;
            }
            Step::Switch => {
                if let Some((device, _)) = switch.take() {
                    if let Err(e) = controller.select_device(&device) {
                        error!("device switch failed: {:#}", e);
                    }
                }
            }
            Step::Report => info!("{} [{}]", controller.health().summary(), controller.state()),
            Step::Event(None) => break,
            Step::Event(Some(_)) => {
                if !controller.has_graph() {
                    info!("back at home view");
                    break;
                }
            }
        }
    }
    Ok(())
}

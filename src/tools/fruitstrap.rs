// Jackson Coxson
// Install, mount, launch and copy files, all from one command

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use fruitstrap::{
    IdeviceError, Session,
    config::FruitstrapConfig,
    installation_proxy::ProgressUpdate,
    pairing_file::PairingFile,
    session::{Stage, StageError},
    usbmuxd::DeviceSelector,
    utils::{
        bundle::AppBundle,
        files,
        installation::{self, InstallProgress},
        launch,
        mount::{self, DeviceSupportPaths, MountResult},
    },
};
use futures::{StreamExt, pin_mut};
use tracing_subscriber::EnvFilter;

/// Exit code when the app dies from a signal or stops
const SIGNALED_EXIT: i32 = 6;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => 1,
            CliError::Stage(e) => e.exit_code(),
        }
    }
}

/// Prints progress lines to stderr, skipping repeats
#[derive(Debug, Default)]
struct StatusPrinter {
    last: Mutex<String>,
}

impl StatusPrinter {
    fn show(&self, action: &str, percent: Option<u64>, status: Option<&str>, path: Option<&str>) {
        let mut show = vec![format!("[{action}]")];
        if let Some(p) = percent {
            show.push(format!("{:>4}", format!("{p}%")));
        }
        show.extend(status.map(String::from));
        show.extend(path.map(String::from));
        let line = show.join(" ");

        if let Ok(mut last) = self.last.lock() {
            if *last != line {
                eprintln!("{line}");
                *last = line;
            }
        }
    }
}

fn command() -> Command {
    Command::new("fruitstrap")
        .about("Install, mount and launch apps on iOS devices without Xcode")
        .after_help("Set RUST_LOG to info, debug, warn, error, or trace to see more logs.")
        .next_help_heading("Global Configuration")
        .arg(
            Arg::new("udid")
                .long("udid")
                .alias("device-id")
                .value_name("UDID")
                .help("UDID of the device to use, the first attached device otherwise"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Seconds to wait for slow operations before giving up"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("TOML file with timeouts, service names and launch environment"),
        )
        .arg(
            Arg::new("pairing_file")
                .long("pairing-file")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Pair record to use instead of the one usbmuxd holds"),
        )
        .arg(
            Arg::new("bundle")
                .short('b')
                .long("bundle")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Local app bundle to operate on"),
        )
        .arg(
            Arg::new("appid")
                .long("appid")
                .value_name("BUNDLE_ID")
                .help("Application identifier to operate on"),
        )
        .next_help_heading("Application Management")
        .arg(
            Arg::new("install")
                .short('i')
                .long("install")
                .action(ArgAction::SetTrue)
                .help("Install the bundle"),
        )
        .arg(
            Arg::new("uninstall")
                .short('u')
                .long("uninstall")
                .action(ArgAction::SetTrue)
                .help("Uninstall the application"),
        )
        .arg(
            Arg::new("list_applications")
                .short('l')
                .long("list-applications")
                .action(ArgAction::SetTrue)
                .help("List installed applications"),
        )
        .arg(
            Arg::new("run")
                .short('r')
                .long("run")
                .action(ArgAction::SetTrue)
                .help("Run the application and relay its output"),
        )
        .arg(
            Arg::new("args")
                .short('a')
                .long("args")
                .alias("arguments")
                .value_name("ARG")
                .num_args(1..)
                .allow_hyphen_values(true)
                .help("Arguments passed to the application being run"),
        )
        .next_help_heading("Developer Disk Image")
        .arg(
            Arg::new("mount")
                .short('m')
                .long("mount")
                .action(ArgAction::SetTrue)
                .help("Mount the developer disk image, needed at least once to run"),
        )
        .arg(
            Arg::new("unmount")
                .long("unmount")
                .action(ArgAction::SetTrue)
                .help("Unmount every mounted developer disk image"),
        )
        .arg(
            Arg::new("developer_disk_image")
                .long("developer-disk-image")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Path to DeveloperDiskImage.dmg"),
        )
        .arg(
            Arg::new("device_support")
                .long("device-support")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("DeviceSupport directory searched for the disk image"),
        )
        .next_help_heading("File Access")
        .arg(
            Arg::new("get_file")
                .long("get-file")
                .num_args(2)
                .value_names(["DEVICE_FILE", "LOCAL_FILE"])
                .help("Read a file from the device"),
        )
        .arg(
            Arg::new("put_file")
                .long("put-file")
                .num_args(2)
                .value_names(["LOCAL_FILE", "DEVICE_FILE"])
                .help("Write a file to the device"),
        )
        .arg(
            Arg::new("list_files")
                .long("list-files")
                .num_args(0..=1)
                .default_missing_value(".")
                .value_name("PATH")
                .help("Recursively list files, starting at the given path"),
        )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = command().get_matches();
    let code = match run(&matches).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn has_action(matches: &ArgMatches) -> bool {
    [
        "install",
        "uninstall",
        "list_applications",
        "run",
        "mount",
        "unmount",
    ]
    .iter()
    .any(|f| matches.get_flag(f))
        || ["get_file", "put_file", "list_files"]
            .iter()
            .any(|a| matches.contains_id(a))
}

fn load_config(matches: &ArgMatches) -> Result<FruitstrapConfig, CliError> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => FruitstrapConfig::from_file(path)
            .map_err(|e| CliError::Usage(format!("{}: {e}", path.display())))?,
        None => FruitstrapConfig::default(),
    };
    Ok(match matches.get_one::<u64>("timeout") {
        Some(secs) if *secs > 0 => config.with_operation_timeout(Duration::from_secs(*secs)),
        _ => config,
    })
}

/// The app the command operates on, from `--appid` or the bundle's Info.plist
async fn bundle_id(matches: &ArgMatches) -> Result<Option<String>, CliError> {
    if let Some(id) = matches.get_one::<String>("appid") {
        return Ok(Some(id.clone()));
    }
    match matches.get_one::<PathBuf>("bundle") {
        Some(path) => AppBundle::bundle_id_of(path)
            .await
            .map(Some)
            .map_err(|e| CliError::Usage(format!("{}: {e}", path.display()))),
        None => Ok(None),
    }
}

async fn run(matches: &ArgMatches) -> Result<i32, CliError> {
    if !has_action(matches) {
        println!("Nothing to do.");
        return Ok(0);
    }

    let config = load_config(matches)?;
    let pairing_file = match matches.get_one::<PathBuf>("pairing_file") {
        Some(path) => Some(
            PairingFile::read_from_file(path)
                .map_err(|e| CliError::Usage(format!("{}: {e}", path.display())))?,
        ),
        None => None,
    };
    let app = bundle_id(matches).await?;
    let selector = DeviceSelector::from(matches.get_one::<String>("udid").cloned());

    match &selector {
        DeviceSelector::Any => eprintln!("Waiting for a device..."),
        DeviceSelector::Udid(udid) => eprintln!("Waiting for a device with UDID {udid}..."),
    }
    let mut session = match Session::connect(&selector, config, pairing_file).await {
        Ok(s) => s,
        Err(e) => {
            let stage = Stage::of_connect_failure(&e);
            return Err(StageError::new(stage, selector.to_string(), e).into());
        }
    };
    eprintln!("Connected to device with UDID: {}", session.udid());

    let closer = session.closer();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted.");
            closer.close();
        }
    });

    let printer = Arc::new(StatusPrinter::default());
    let res = run_actions(matches, &mut session, app, printer).await;
    if let Err(e) = session.close().await {
        tracing::debug!("Closing the session failed: {e}");
    }
    res
}

async fn run_actions(
    matches: &ArgMatches,
    session: &mut Session,
    app: Option<String>,
    printer: Arc<StatusPrinter>,
) -> Result<i32, CliError> {
    let udid = session.udid().to_string();
    let fail = |stage: Stage| {
        let udid = udid.clone();
        move |e: IdeviceError| CliError::Stage(StageError::new(stage, udid, e))
    };

    if matches.get_flag("unmount") {
        let count = mount::unmount(session).await.map_err(fail(Stage::Mount))?;
        eprintln!("Unmounted {count} developer disk image(s).");
    }

    if matches.get_flag("mount") {
        let image = match matches.get_one::<PathBuf>("developer_disk_image") {
            Some(p) => p.clone(),
            None => {
                let root = matches
                    .get_one::<PathBuf>("device_support")
                    .cloned()
                    .unwrap_or_else(DeviceSupportPaths::default_root);
                DeviceSupportPaths::for_device(root, session.capabilities())
                    .developer_disk_image()
                    .map_err(fail(Stage::Mount))?
            }
        };
        eprintln!("\nMounting {}...", image.display());
        let res = mount::mount_with_progress(
            session,
            &image,
            |((sent, total), printer): ((usize, usize), Arc<StatusPrinter>)| async move {
                let percent = (sent as u64 * 100) / (total.max(1) as u64);
                printer.show("Mounting", Some(percent), Some("Uploading"), None);
            },
            printer.clone(),
        )
        .await
        .map_err(fail(Stage::Mount))?;
        match res {
            MountResult::Mounted => eprintln!("Developer disk image mounted."),
            MountResult::AlreadyMounted => eprintln!("Developer disk image already mounted."),
        }
    }

    if matches.get_flag("uninstall") {
        let id = app
            .as_deref()
            .ok_or_else(|| CliError::Usage("--uninstall needs --appid or --bundle".into()))?;
        eprintln!("\nUninstalling {id}...");
        installation::uninstall_with_callback(
            session,
            id,
            |(update, printer): (ProgressUpdate, Arc<StatusPrinter>)| async move {
                printer.show("Uninstalling", update.percent, update.status.as_deref(), None);
            },
            printer.clone(),
        )
        .await
        .map_err(fail(Stage::Install))?;
    }

    if matches.get_flag("install") {
        let path = matches
            .get_one::<PathBuf>("bundle")
            .ok_or_else(|| CliError::Usage("--install needs --bundle".into()))?;
        let bundle = AppBundle::read(path)
            .await
            .map_err(|e| CliError::Usage(format!("{}: {e}", path.display())))?;
        eprintln!("\nInstalling {}...", path.display());
        let transaction = installation::install_with_callback(
            session,
            &bundle,
            |(progress, printer): (InstallProgress, Arc<StatusPrinter>)| async move {
                match progress {
                    InstallProgress::Transferring {
                        path,
                        bytes_sent,
                        total,
                    } => printer.show(
                        "Transferring",
                        Some(bytes_sent * 100 / total.max(1)),
                        Some("Copying"),
                        Some(path.as_str()),
                    ),
                    InstallProgress::Installing { percent, status } => {
                        printer.show("Installing", Some(percent), status.as_deref(), None)
                    }
                }
            },
            printer.clone(),
        )
        .await
        .map_err(fail(Stage::Install))?;
        eprintln!(
            "{:?} of {} finished at {}%.",
            transaction.operation,
            transaction.bundle_id,
            transaction.percent()
        );
    }

    if matches.get_flag("list_applications") {
        println!("\nInstalled applications:");
        let apps = installation::lookup_applications(session)
            .await
            .map_err(fail(Stage::Install))?;
        for id in apps {
            println!("{id}");
        }
    }

    if matches.contains_id("get_file") || matches.contains_id("put_file") || matches.contains_id("list_files") {
        file_actions(matches, session, app.as_deref())
            .await
            .map_err(fail(Stage::Files))?;
    }

    if matches.get_flag("run") {
        let id = app
            .as_deref()
            .ok_or_else(|| CliError::Usage("--run needs --appid or --bundle".into()))?;
        let args: Vec<String> = matches
            .get_many::<String>("args")
            .map(|a| a.cloned().collect())
            .unwrap_or_default();
        return run_app(session, id, &args).await.map_err(fail(Stage::Launch));
    }

    Ok(0)
}

async fn file_actions(
    matches: &ArgMatches,
    session: &mut Session,
    app: Option<&str>,
) -> Result<(), IdeviceError> {
    let mut afc = files::open_container(session, app).await?;

    if let Some(mut v) = matches.get_many::<String>("get_file") {
        let (Some(device), Some(local)) = (v.next(), v.next()) else {
            return Err(IdeviceError::InvalidArgument("--get-file needs two paths".into()));
        };
        let n = files::get_file(&mut afc, device, Path::new(local)).await?;
        println!("{n} bytes read from {device}.");
    } else if let Some(mut v) = matches.get_many::<String>("put_file") {
        let (Some(local), Some(device)) = (v.next(), v.next()) else {
            return Err(IdeviceError::InvalidArgument("--put-file needs two paths".into()));
        };
        let n = files::put_file(&mut afc, Path::new(local), device).await?;
        println!("{n} bytes written to {device}.");
    } else if let Some(root) = matches.get_one::<String>("list_files") {
        println!("Listing {root}:");
        for (depth, path) in files::walk(&mut afc, root).await? {
            println!("{}{path}", "  ".repeat(depth));
        }
    }
    afc.idevice.close().await
}

/// Runs the app until it ends, returning the exit code to use
async fn run_app(session: &mut Session, bundle_id: &str, args: &[String]) -> Result<i32, IdeviceError> {
    let mut handle = launch::launch(session, bundle_id, args).await?;
    eprintln!("\nRunning {}...", handle.argv().join(" "));

    {
        let output = handle.output_stream();
        pin_mut!(output);
        let mut stdout = std::io::stdout();
        while let Some(bytes) = output.next().await {
            let bytes = match bytes {
                Ok(b) => b,
                Err(IdeviceError::Cancelled) => return Ok(SIGNALED_EXIT),
                Err(e) => return Err(e),
            };
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }

    match handle.exit_status() {
        Some(status) => {
            eprintln!("{status}");
            Ok(status.code().unwrap_or(SIGNALED_EXIT))
        }
        None => Err(IdeviceError::Disconnected),
    }
}

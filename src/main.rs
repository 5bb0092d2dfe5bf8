//! Binary entrypoint for the MeshX CLI.
//!
//! Commands:
//! - `run` - bring up a node on the simulated port and log bus traffic until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print the persisted device state and configured composition as JSON
//! - `ut <args…>` - run one unit-test console command against a fresh node
//!
//! See the library crate docs for module-level details: `meshx::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use meshx::api::{CtrlCallback, CtrlMsgHeader, DataCallback, ElementMsgHeader};
use meshx::composition::ElementType;
use meshx::config::Config;
use meshx::control::{to_hal, Code, EventMask, HandlerRef};
use meshx::elements::ElementCtx;
use meshx::logutil::hex_preview;
use meshx::models::{decode, HalCtl, HalOnOff};
use meshx::node::{Device, MeshxNode, MeshxStore, NodeCallbacks, MESHX_STORE_KEY};
use meshx::nvs::Nvs;
use meshx::os::TimerService;
use meshx::port::sim::SimPort;

#[derive(Parser)]
#[command(name = "meshx")]
#[command(about = "Bluetooth mesh node core on a simulated mesh port")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl-C
    Run,
    /// Write a default configuration file
    Init,
    /// Show persisted node state
    Status,
    /// Run one console command, e.g. `meshx ut 3 1 2 answer 42`
    Ut {
        /// Module id, command id, argc and arguments
        #[arg(required = true, num_args = 3..)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Run => {
            let config = load_or_default(pre_config, &cli.config);
            config.validate()?;
            info!("Starting MeshX v{}", env!("CARGO_PKG_VERSION"));
            let console_enabled = config.console.enabled;
            let node = MeshxNode::start(config, Arc::new(SimPort::new()), logging_callbacks())?;
            attach_hal_logger(node.device())?;

            if console_enabled {
                tokio::select! {
                    r = run_repl(&node) => r?,
                    _ = tokio::signal::ctrl_c() => info!("interrupted"),
                }
            } else {
                tokio::signal::ctrl_c().await?;
                info!("interrupted");
            }
            node.shutdown().await?;
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = load_or_default(pre_config, &cli.config);
            show_status(&config)?;
        }
        Commands::Ut { args } => {
            let mut config = load_or_default(pre_config, &cli.config);
            config.validate()?;
            config.console.enabled = true;
            let node = MeshxNode::start(config, Arc::new(SimPort::new()), logging_callbacks())?;
            attach_hal_logger(node.device())?;
            let line = format!("ut {}", args.join(" "));
            let outcome = node.console_exec(&line);
            // let queued requests reach their handlers before stopping
            tokio::time::sleep(Duration::from_millis(100)).await;
            node.shutdown().await?;
            match outcome {
                Ok(out) => println!("{}", out),
                Err(e) => return Err(anyhow!("ut failed ({}): {}", e.code(), e)),
            }
        }
    }

    Ok(())
}

fn load_or_default(pre: Option<Config>, path: &str) -> Config {
    pre.unwrap_or_else(|| {
        warn!("no usable config at {}, using defaults", path);
        Config::default()
    })
}

fn logging_callbacks() -> NodeCallbacks {
    let data: DataCallback = Arc::new(|hdr: &ElementMsgHeader, payload: &[u8]| -> meshx::Result<()> {
        let kind = ElementType::from_u16(hdr.element_type)
            .map(|t| t.name())
            .unwrap_or("unknown");
        info!(
            "app <- element {} ({}) func={} [{}]",
            hdr.element_id,
            kind,
            hdr.func_id,
            hex_preview(payload)
        );
        Ok(())
    });
    let ctrl: CtrlCallback = Arc::new(|hdr: &CtrlMsgHeader, payload: &[u8]| -> meshx::Result<()> {
        info!("app <- ctrl evt=0x{:04x} [{}]", hdr.evt, hex_preview(payload));
        Ok(())
    });
    NodeCallbacks {
        data: Some(data),
        ctrl: Some(ctrl),
    }
}

/// The simulated node has no hardware; HAL commands go to the log.
fn attach_hal_logger(dev: &Device) -> meshx::Result<()> {
    let handler: HandlerRef<Device> = Arc::new(|_: &Device, evt: EventMask, payload: &[u8]| -> meshx::Result<()> {
        if evt & to_hal::SET_ON_OFF != 0 {
            let cmd: HalOnOff = decode(payload)?;
            info!("hal: element {} on_off={}", cmd.element_id, cmd.on_off);
        } else {
            let cmd: HalCtl = decode(payload)?;
            info!(
                "hal: element {} lightness=0x{:04x} temperature=0x{:04x} delta_uv=0x{:04x}",
                cmd.element_id, cmd.lightness, cmd.temperature, cmd.delta_uv
            );
        }
        Ok(())
    });
    dev.bus.subscribe(
        Code::ToHal,
        to_hal::SET_ON_OFF | to_hal::SET_TEMP | to_hal::SET_LIGHTNESS | to_hal::SET_CTL,
        handler,
    )
}

async fn run_repl(node: &MeshxNode) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"meshx> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            return Ok(());
        }
        let reply = match node.console_exec(line) {
            Ok(out) => format!("{}\n", out),
            Err(e) => format!("error {}: {}\n", e.code(), e),
        };
        stdout.write_all(reply.as_bytes()).await?;
    }
}

fn show_status(config: &Config) -> Result<()> {
    let nvs = Nvs::init(&config.nvs.data_dir, TimerService::new())?;
    nvs.open(config.device.cid, config.device.pid, 0)?;
    let store: Option<MeshxStore> = nvs.get_value(MESHX_STORE_KEY).ok();
    let worst = config.composition.worst_case_element_count();
    let contexts: Vec<serde_json::Value> = (0..worst as u16)
        .filter_map(|id| {
            nvs.element_ctx_get::<ElementCtx>(id)
                .ok()
                .map(|ctx| serde_json::json!({ "element_id": id, "ctx": ctx }))
        })
        .collect();
    nvs.close()?;

    let status = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "product_name": config.device.product_name,
        "cid": config.device.cid,
        "pid": config.device.pid,
        "provisioned": store.map(|s| s.node_addr != 0).unwrap_or(false),
        "store": store,
        "composition": config.composition.elements,
        "element_contexts": contexts,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(ref file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
            let _ = builder.try_init();
            return;
        }
    }
    builder.format(|fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
    });
    let _ = builder.try_init();
}

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use bluest_core::node::DEFAULT_NODE_CONFIG;
use bluest_core::transfer::{TransferConfig, DEFAULT_TRANSFER_CONFIG};
use bluest_proto::{parse_mask, UpgradeCommand};
use clap::{Parser, Subcommand};
use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Delay, Timer};
use log::{error, info, warn};
use simba_host::{
    describe, parse_hex, parse_mask_arg, BlueStNode, CancelToken, Event, SimulatedNode,
    DEFAULT_SIM_CONFIG,
};
use static_cell::StaticCell;

/// Events queued between the node and the printer.
const EVENT_QUEUE: usize = 32;

type EventChannel = Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE>;
type EventSender = Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE>;
type EventReceiver = Receiver<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE>;
type Node = BlueStNode<SimulatedNode, Delay, EventSender>;

/// Node events, drained by the printer task.
static EVENTS: StaticCell<EventChannel> = StaticCell::new();

/// Set by Ctrl-C while an upgrade runs.
static CANCEL: CancelToken = CancelToken::new();

/// Host tool for BlueST sensor nodes
#[derive(Parser, Debug)]
#[command(name = "simba-host", version, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode one notification payload against a feature mask
    Decode {
        /// Characteristic mask, e.g. 0x001C0000
        #[arg(value_parser = parse_mask_arg)]
        mask: u32,
        /// Payload bytes in hex, timestamp included
        payload: String,
    },
    /// Print the checksum and upgrade frame for a firmware image
    Crc {
        /// Firmware image
        image: PathBuf,
    },
    /// Query the firmware version of the simulated node
    Version,
    /// Upload a firmware image to the simulated node
    Upgrade {
        /// Firmware image
        image: PathBuf,
        /// Make the node echo a wrong checksum
        #[arg(long, default_value_t = false)]
        corrupt_echo: bool,
        /// Wait after the node acknowledged the image, in milliseconds
        #[arg(long, default_value_t = 1_000)]
        reboot_grace_ms: u32,
    },
    /// Stream sensor values from the simulated node
    Monitor {
        /// Stop after this many notifications
        #[arg(short, long, default_value_t = 20)]
        count: usize,
        /// Only enable features in this mask
        #[arg(long, value_parser = parse_mask_arg)]
        mask: Option<u32>,
    },
}

/// Work the session task does against the node.
#[derive(Debug)]
enum Session {
    Version,
    Upgrade(Vec<u8>),
    Monitor { count: usize, mask: Option<u32> },
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    if let Err(e) = start(spawner, cli.command) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Run offline commands directly; spawn the node tasks for the rest.
fn start(spawner: Spawner, command: Command) -> anyhow::Result<()> {
    let mut sim = DEFAULT_SIM_CONFIG;
    let mut config = DEFAULT_NODE_CONFIG;

    let session = match command {
        Command::Decode { mask, payload } => {
            decode(mask, &payload)?;
            std::process::exit(0);
        }
        Command::Crc { image } => {
            let image = read_image(&image)?;
            let command = UpgradeCommand::for_image(&image).context("image too large")?;
            println!("length {} bytes", command.length);
            println!("crc    {:#010x}", command.crc);
            let frame: Vec<String> = command.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
            println!("frame  {}", frame.join(" "));
            std::process::exit(0);
        }
        Command::Version => Session::Version,
        Command::Upgrade {
            image,
            corrupt_echo,
            reboot_grace_ms,
        } => {
            sim.corrupt_crc_echo = corrupt_echo;
            config.transfer = TransferConfig {
                reboot_grace_ms,
                ..DEFAULT_TRANSFER_CONFIG
            };
            let image = read_image(&image)?;
            ctrlc::set_handler(|| {
                if CANCEL.is_cancelled() {
                    std::process::exit(130);
                }
                warn!("cancelling upgrade, press Ctrl-C again to quit");
                CANCEL.cancel();
            })
            .context("installing Ctrl-C handler")?;
            Session::Upgrade(image)
        }
        Command::Monitor { count, mask } => Session::Monitor { count, mask },
    };

    let events = EVENTS.init(Channel::new());
    let node = BlueStNode::with_config(SimulatedNode::new(sim), Delay, events.sender(), config);

    spawner.spawn(
        event_task(events.receiver()).map_err(|e| anyhow!("spawning event task: {e:?}"))?,
    );
    spawner.spawn(session_task(node, session).map_err(|e| anyhow!("spawning session task: {e:?}"))?);
    Ok(())
}

fn read_image(path: &Path) -> anyhow::Result<Vec<u8>> {
    let image =
        std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    info!("loaded {} ({} bytes)", path.display(), image.len());
    Ok(image)
}

fn decode(mask: u32, payload: &str) -> anyhow::Result<()> {
    let payload = parse_hex(payload)?;
    let bindings = parse_mask(mask);
    if bindings.is_empty() {
        warn!("mask {mask:#010x} names no known feature");
    }
    for binding in &bindings {
        let definition = binding.definition;
        match definition.decode(&payload, binding.offset) {
            Ok(value) => println!("{} = {} {}", definition.name, value, definition.unit),
            Err(e) => println!("{} = <{}>", definition.name, e),
        }
    }
    Ok(())
}

/// Event printer task - logs everything the node reports.
#[embassy_executor::task]
async fn event_task(receiver: EventReceiver) {
    loop {
        let event = receiver.receive().await;
        match event {
            Event::TransferFailed(_) => error!("{}", describe(&event)),
            Event::StatusMessage(_) => warn!("{}", describe(&event)),
            _ => info!("{}", describe(&event)),
        }
    }
}

/// Session task - discovers the node, runs one session, then exits.
#[embassy_executor::task]
async fn session_task(mut node: Node, session: Session) {
    let code = match run(&mut node, session).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    // Give the printer a chance to drain.
    Timer::after_millis(50).await;
    std::process::exit(code);
}

async fn run(node: &mut Node, session: Session) -> anyhow::Result<()> {
    let features = node.discover().await.context("discovery")?;
    info!("{} features on the node", features);

    match session {
        Session::Version => {
            node.query_version().await.context("version query")?;
        }
        Session::Upgrade(image) => {
            node.upgrade(&image, &CANCEL).await.context("upgrade")?;

            // The node rebooted into the new image.
            node.discover().await.context("rediscovery")?;
            if let Err(e) = node.query_version().await {
                warn!("version after upgrade: {e}");
            }
        }
        Session::Monitor { count, mask } => {
            let wanted: Vec<_> = node
                .channels()
                .features()
                .map(|(feature, _)| feature)
                .filter(|feature| mask.map_or(true, |m| m & feature.mask != 0))
                .collect();
            for feature in wanted {
                node.enable_feature(feature).await.context("enabling feature")?;
            }
            for _ in 0..count {
                node.process_one().await.context("receiving")?;
            }
        }
    }
    Ok(())
}

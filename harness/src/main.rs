#[macro_use]
extern crate log;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

mod command;
mod sampler;
mod server;

use crate::command::{Command, Execution};
use crate::server::Servers;

type Error = Box<dyn std::error::Error>;

#[derive(StructOpt)]
#[structopt(name = "harness")]
struct Opt {
    /// Scenario to execute
    #[structopt(short = "f", long = "file")]
    file: PathBuf,

    /// Cluster and timer configuration; defaults to two groups {1, 2, 3} and {4, 5, 6}
    #[structopt(short = "c", long = "config")]
    config: Option<PathBuf>,

    /// Run nodes over loopback TCP instead of the in-memory network
    #[structopt(long = "tcp")]
    tcp: bool,

    /// Base port for nodes without a configured address
    #[structopt(short = "p", long = "port", default_value = "7000")]
    port: u16,

    /// Log verbosity: -v info, -vv debug, -vvv trace
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,
}

fn setup_logging(verbose: u8) -> Result<(), fern::InitError> {
    let level = match verbose {
    | 0 => log::LevelFilter::Warn,
    | 1 => log::LevelFilter::Info,
    | 2 => log::LevelFilter::Debug,
    | _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

/// Loopback address of `id` when node ports are assigned from `base`.
fn loopback(base: u16, id: metacoord::NodeId) -> Result<SocketAddr, Error> {
    let port = u16::try_from(id)
        .ok()
        .and_then(|id| base.checked_add(id))
        .ok_or_else(|| format!("node {} has no port above base {}", id, base))?;
    Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

fn load(opt: &Opt) -> Result<metacoord::Config, Error> {
    let mut config = match &opt.config {
    | Some(path) => serde_json::from_reader(std::fs::File::open(path)?)?,
    | None => metacoord::Config::default(),
    };
    if opt.tcp {
        for spec in &mut config.cluster.groups {
            for member in &mut spec.members {
                if member.address.is_none() {
                    member.address = Some(loopback(opt.port, member.id)?);
                }
            }
        }
    }
    config.validate()?;
    Ok(config)
}

async fn run(opt: Opt) -> Result<(), Error> {
    let execution: Execution = serde_json::from_reader(std::fs::File::open(&opt.file)?)?;
    let mut servers = Servers::new(load(&opt)?, opt.tcp);

    for command in execution.0 {
        println!("Executing command {:?}", command);
        match command {
        | Command::Start { id } | Command::Restore { id } => servers.start(id).await?,
        | Command::StartAll => {
            for id in servers.ids() {
                servers.start(id).await?;
            }
        }
        | Command::Crash { id } => servers.crash(id),
        | Command::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        | Command::Snapshot { id } => {
            if let Some(node) = servers.node(id) {
                node.initiate_snapshot();
            }
        }
        | Command::Authenticate { id } => {
            match servers.node(id) {
            | Some(node) if node.is_acting_leader() => node.client_authenticated(),
            | Some(_) => println!("node {} is not the acting leader; authentication refused", id),
            | None => (),
            }
        }
        | Command::Status => servers.status(),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opt = Opt::from_args();
    setup_logging(opt.verbose)?;
    run(opt).await
}

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use clap_derive::Parser;
use tracing::{error, info, warn, Level};
use stopwait::config::ArqConfig;
use stopwait::latency::{Histogram, LatencySummary};
use stopwait::receiver::{ReceivedTransfer, Receiver, TransferSink};
use stopwait::sender::Sender;
use stopwait::socket::bind_udp;
use stopwait::verify::verify;

/// Reliable file transfer over UDP using a stop-and-wait protocol with CRC-32 checksums
#[derive(Parser, Debug)]
#[clap(name = "stopwait")]
#[clap(group(ArgGroup::new("mode").required(true).args(["client", "server", "verify"])))]
struct Args {
    /// send a file to a server
    #[clap(long, num_args = 3, value_names = ["SERVER_IP", "PORT", "FILENAME"])]
    client: Option<Vec<String>>,

    /// receive files, optionally saving them
    #[clap(long, num_args = 1..=2, value_names = ["PORT", "OUTPUT_FILE"])]
    server: Option<Vec<String>>,

    /// compare a received file to the original
    #[clap(long, num_args = 2, value_names = ["ORIGINAL_FILE", "RECEIVED_FILE"])]
    verify: Option<Vec<String>>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, PartialEq)]
enum Mode {
    Client { server_addr: SocketAddr, file: PathBuf },
    Server { port: u16, output_file: Option<PathBuf> },
    Verify { original_file: PathBuf, received_file: PathBuf },
}

impl Args {
    fn mode(&self) -> anyhow::Result<Mode> {
        match (&self.client, &self.server, &self.verify) {
            (Some(client), None, None) => {
                let ip: IpAddr = client[0].parse()
                    .with_context(|| format!("invalid server IP address {:?}", client[0]))?;
                Ok(Mode::Client {
                    server_addr: SocketAddr::new(ip, parse_port(&client[1])?),
                    file: PathBuf::from(&client[2]),
                })
            }
            (None, Some(server), None) => Ok(Mode::Server {
                port: parse_port(&server[0])?,
                output_file: server.get(1).map(PathBuf::from),
            }),
            (None, None, Some(verify)) => Ok(Mode::Verify {
                original_file: PathBuf::from(&verify[0]),
                received_file: PathBuf::from(&verify[1]),
            }),
            _ => Err(anyhow!("exactly one of --client, --server and --verify is required")),
        }
    }
}

fn parse_port(s: &str) -> anyhow::Result<u16> {
    s.parse()
        .with_context(|| format!("invalid port {:?}", s))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let result = match args.mode() {
        Ok(Mode::Client { server_addr, file }) => run_client(server_addr, file).await,
        Ok(Mode::Server { port, output_file }) => run_server(port, output_file).await,
        Ok(Mode::Verify { original_file, received_file }) => run_verify(original_file, received_file).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_client(server_addr: SocketAddr, file: PathBuf) -> anyhow::Result<ExitCode> {
    let data = tokio::fs::read(&file).await
        .with_context(|| format!("could not read {:?}", file))?;
    if data.is_empty() {
        warn!("file {:?} is empty, but will still be sent", file);
    }

    let config = Arc::new(ArqConfig::default());
    let local_ip = match server_addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = bind_udp(SocketAddr::new(local_ip, 0), config.socket_buffer_size)?;

    let mut sender = Sender::new(config.clone(), Arc::new(socket), server_addr)?;
    let result = sender.send(&data).await;

    let latency = sender.latency();
    print_statistics(&latency.summary(), latency.histogram(config.histogram_bins).filter(|_| latency.len() > config.histogram_min_samples));

    match result {
        Ok(report) => {
            info!("file transfer complete: {:?} ({} bytes, {} retransmissions)", file, report.bytes, report.retransmissions);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("file transfer failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Writes each completed transfer to the output file (if any), overwriting the previous one
struct FileSink {
    output_file: Option<PathBuf>,
}

#[async_trait]
impl TransferSink for FileSink {
    async fn on_transfer_complete(&self, transfer: &ReceivedTransfer) -> anyhow::Result<()> {
        info!("data reception from {:?} complete: {} bytes", transfer.from, transfer.data.len());
        print_statistics(&transfer.latency, transfer.histogram.clone());

        if let Some(output_file) = &self.output_file {
            tokio::fs::write(output_file, &transfer.data).await
                .with_context(|| format!("could not write {:?}", output_file))?;
            info!("data saved to {:?}", output_file);
        }
        Ok(())
    }
}

async fn run_server(port: u16, output_file: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = Arc::new(ArqConfig::default());
    let socket = bind_udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), config.socket_buffer_size)?;
    info!("server started on port {}", port);
    if let Some(output_file) = &output_file {
        info!("data will be saved to {:?}", output_file);
    }

    let mut receiver = Receiver::new(config, Arc::new(socket))?;
    receiver.run(&FileSink { output_file }).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_verify(original_file: PathBuf, received_file: PathBuf) -> anyhow::Result<ExitCode> {
    let original = tokio::fs::read(&original_file).await
        .with_context(|| format!("could not read {:?}", original_file))?;
    let received = tokio::fs::read(&received_file).await
        .with_context(|| format!("could not read {:?}", received_file))?;

    let report = verify(&original, &received);
    println!("{}", report);

    if report.matches() {
        Ok(ExitCode::SUCCESS)
    }
    else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_statistics(summary: &LatencySummary, histogram: Option<Histogram>) {
    println!("{}", summary);
    if let Some(histogram) = histogram {
        print!("{}", histogram);
    }
}

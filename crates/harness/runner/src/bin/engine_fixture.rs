//! Stand-in for the secure computation engine.
//!
//! Accepts the engine's command line. Role 1 sends its share to role 0 over
//! TCP, role 0 recombines the reference from both shares and prints a report
//! in the engine's layout with the cosine distance of each probe.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use harness_core::{
    distance::cosine_distance,
    input::{batch_input_path, parse_pairs},
    report::BATCH_DELIMITER,
    share::{BitWidth, Share},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

const RETRY_DELAY: u64 = 50;
const MAX_RETRIES: usize = 200;
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "pffrocd-engine-fixture")]
struct Args {
    /// Role, 0 or 1.
    #[arg(short = 'r')]
    role: u8,
    /// Address of role 0.
    #[arg(short = 'a', default_value = "127.0.0.1")]
    address: String,
    #[arg(short = 'p', default_value = "7766")]
    port: u16,
    /// Input file, or file prefix with `-d`.
    #[arg(short = 'f')]
    input: PathBuf,
    /// Reference share of this role.
    #[arg(short = 'y')]
    share: Option<PathBuf>,
    #[arg(short = 'b', default_value = "64")]
    bit_width: u32,
    #[arg(short = 'o')]
    output_dir: Option<PathBuf>,
    #[arg(short = 's', default_value = "128")]
    security_level: u32,
    #[arg(short = 'x', default_value = "0")]
    mt_algorithm: u8,
    /// Number of batched input files.
    #[arg(short = 'd')]
    batch: Option<usize>,
    /// Prints an empty segment in place of this batch position's report.
    #[arg(long)]
    blank_segment: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let width = BitWidth::try_from(args.bit_width)?;
    let addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .context("invalid address")?;

    let share = match &args.share {
        Some(path) => Some(Share::from_text(width, &read(path)?)?),
        None => None,
    };

    match args.role {
        0 => serve(&args, addr, width, share).await,
        1 => send_share(addr, share).await,
        role => bail!("invalid role {role}"),
    }
}

async fn serve(args: &Args, addr: SocketAddr, width: BitWidth, share: Option<Share>) -> Result<()> {
    let start = Instant::now();
    let inputs = match args.batch {
        Some(count) => (0..count)
            .map(|idx| read(&batch_input_path(&args.input, idx)))
            .collect::<Result<Vec<_>>>()?,
        None => vec![read(&args.input)?],
    };

    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;
    let (mut stream, _) = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept())
        .await
        .context("peer did not connect")??;
    let setup = start.elapsed();

    let mut peer = String::new();
    stream.read_to_string(&mut peer).await?;
    let received = peer.len();

    let reference = match share {
        Some(share) => Some(share.xor(&Share::from_text(width, &peer)?)?.values()),
        None => None,
    };

    let mut reports = Vec::with_capacity(inputs.len());
    for (idx, text) in inputs.iter().enumerate() {
        if args.blank_segment == Some(idx) {
            reports.push(String::new());
            continue;
        }
        let (x, y) = parse_pairs(text)?;
        let cos_dist_ver = cosine_distance(&x, &y)?;
        let cos_dist_sfe = cosine_distance(&x, reference.as_ref().unwrap_or(&y))?;
        reports.push(render_report(
            x.len(),
            start.elapsed(),
            setup,
            received,
            args.security_level,
            cos_dist_ver,
            cos_dist_sfe,
        ));
    }

    println!(
        "Computing cosine distance of {} inputs, security level {}, mt algorithm {}, circuits in {}",
        inputs.len(),
        args.security_level,
        args.mt_algorithm,
        args.output_dir
            .as_deref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default()
    );
    println!("{}", reports.join(&format!("\n{BATCH_DELIMITER}\n")));

    Ok(())
}

async fn send_share(addr: SocketAddr, share: Option<Share>) -> Result<()> {
    let mut retries = 0;
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) => {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(e).context("failed to connect to role 0");
                }
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY)).await;
            }
        }
    };

    let text = share.map(|share| share.to_text()).unwrap_or_default();
    stream.write_all(text.as_bytes()).await?;
    stream.shutdown().await?;

    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn render_report(
    n: usize,
    total: Duration,
    setup: Duration,
    received: usize,
    security_level: u32,
    cos_dist_ver: f64,
    cos_dist_sfe: f64,
) -> String {
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let online = ms(total) - ms(setup);
    let sent = n * security_level as usize;

    format!(
        "\
Boolean Sharing: local gates: 0, interactive gates: {online:.3}, layer finish: 0
Yao Sharing: local gates: 0, interactive gates: 0, layer finish: 0
Yao Reverse Sharing: local gates: 0, interactive gates: 0, layer finish: 0
Arithmetic Sharing: local gates: 0, interactive gates: 0, layer finish: 0
SPLUT Sharing: local gates: 0, interactive gates: 0, layer finish: 0
Communication: {online:.3}
Complexities:
Boolean Sharing: ANDs: {ands} ; Depth: 44
Total Vec AND: {ands}
Total Non-Vec AND: 0
XOR vals: {xors} gates: {xors}
Comb.: 0 gates: 0
Combstruct: 0 gates: 0
Perm: 0 gates: 0
Subst: 0 gates: 0
Split: {n} gates: 1
Yao: ANDs: 0 ; Depth: 0
Arithmetic Sharing: MULs: 0 ; Depth: 0
SP-LUT Sharing: OT-gates: 0 ; Depth: 0
Timings:
Total =\t\t{total:.3} ms
Init =\t\t0 ms
CircuitGen =\t0 ms
Network =\t{setup:.3} ms
BaseOTs =\t0 ms
Setup =\t\t0 ms
OTExtension =\t0 ms
Garbling =\t0 ms
Online =\t{online:.3} ms

Communication:
Total Sent / Rcv\t{sent} bytes / {received} bytes
BaseOTs Sent / Rcv\t0 bytes / 0 bytes
Setup Sent / Rcv\t0 bytes / 0 bytes
OTExtension Sent / Rcv\t0 bytes / 0 bytes
Garbling Sent / Rcv\t0 bytes / 0 bytes
Online Sent / Rcv\t{sent} bytes / {received} bytes

cos_dist_ver: {cos_dist_ver}
cos_dist: {cos_dist_sfe}
",
        ands = n * 18,
        xors = n * 64,
        total = ms(total),
        setup = ms(setup),
    )
}

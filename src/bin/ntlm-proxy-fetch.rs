//! Fetch a URL through an NTLM-authenticating HTTP proxy

use std::io::Write;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ntlm_proxy_stream::http::is_valid_header_line;
use ntlm_proxy_stream::{hashes_of, Credentials, ProxyClient, ProxyEvent, ProxyOptions, TransportEvent};

#[derive(Parser, Debug)]
#[command(name = "ntlm-proxy-fetch")]
#[command(about = "HTTP through NTLM-authenticating proxies", long_about = None)]
struct Cli {
    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a GET request through the proxy and print the response
    Fetch(FetchArgs),

    /// Print the LM and NT hashes of a password, for use with --lm-hash and --nt-hash
    Hash {
        /// Password to hash
        password: String,
    },
}

#[derive(Args, Debug)]
struct FetchArgs {
    /// Proxy as host:port
    #[arg(short = 'x', long)]
    proxy: String,

    /// Domain/workgroup
    #[arg(short = 'd', long, default_value = "")]
    domain: String,

    /// Username for authentication
    #[arg(short = 'u', long)]
    user: String,

    /// Password for authentication
    #[arg(short = 'P', long, conflicts_with_all = ["lm_hash", "nt_hash"], required_unless_present = "nt_hash")]
    password: Option<String>,

    /// LM hash as hex
    #[arg(long, requires = "nt_hash")]
    lm_hash: Option<String>,

    /// NT hash as hex
    #[arg(long, requires = "lm_hash")]
    nt_hash: Option<String>,

    /// Workstation name sent to the proxy (defaults to this machine's name)
    #[arg(short = 'w', long)]
    workstation: Option<String>,

    /// Extra header line for the handshake requests, e.g. "Proxy-Connection: keep-alive"
    #[arg(short = 'H', long = "header", value_parser = parse_header_line)]
    headers: Vec<String>,

    /// Stop once the proxy has been silent for this many seconds
    #[arg(short = 't', long, default_value = "10")]
    timeout_secs: u64,

    /// http:// URL to fetch
    url: String,
}

fn parse_header_line(line: &str) -> Result<String, String> {
    if is_valid_header_line(line) {
        Ok(line.to_owned())
    } else {
        Err("expected a single \"Name: value\" line".to_owned())
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_owned())
}

/// Builds an absolute-form GET request for `url`.
fn build_request(url: &str) -> Result<String, String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| format!("only http:// URLs can be fetched: {}", url))?;
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return Err(format!("URL has no host: {}", url));
    }
    Ok(format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: ntlm-proxy-fetch/{}\r\nAccept: */*\r\n\r\n",
        url,
        host,
        env!("CARGO_PKG_VERSION"),
    ))
}

async fn fetch(args: FetchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (proxy_host, proxy_port) = args
        .proxy
        .rsplit_once(':')
        .ok_or_else(|| format!("proxy must be given as host:port: {}", args.proxy))?;
    let proxy_port: u16 = proxy_port.parse()?;
    let request = build_request(&args.url)?;

    let workstation = args.workstation.unwrap_or_else(local_hostname);
    let credentials = match (&args.password, &args.lm_hash, &args.nt_hash) {
        (Some(password), _, _) => Credentials::from_password(&args.domain, &args.user, password, &workstation)?,
        (None, Some(lm), Some(nt)) => Credentials::from_hashes(&args.domain, &args.user, lm, nt, &workstation)?,
        _ => return Err("either --password or both --lm-hash and --nt-hash are required".into()),
    };
    let options = ProxyOptions {
        extra_headers: args.headers,
        // the response to our GET is the one that completes the handshake
        forward_authorized_response: true,
    };

    tracing::info!("Connecting to proxy {}:{} as {}\\{}", proxy_host, proxy_port, args.domain, args.user);
    let mut client = ProxyClient::connect(
        proxy_host,
        proxy_port,
        credentials,
        options,
        Some(Duration::from_secs(args.timeout_secs)),
    )?;
    client.write(request, None).await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = client.next_event().await {
        match event {
            ProxyEvent::Data(bytes) => stdout.write_all(&bytes)?,
            ProxyEvent::Authorized => tracing::info!("Proxy accepted the credentials"),
            ProxyEvent::Error(e) => return Err(e.into()),
            ProxyEvent::Transport(TransportEvent::Error(e)) => return Err(e.into()),
            ProxyEvent::Transport(TransportEvent::Timeout) => {
                tracing::info!("Proxy went quiet, stopping");
                break;
            }
            ProxyEvent::Transport(TransportEvent::Closed) => break,
            other => tracing::debug!("{:?}", other),
        }
    }
    stdout.flush()?;
    client.end().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Fetch(args) => fetch(args).await?,
        Commands::Hash { password } => {
            let pair = hashes_of(&password);
            println!("LM: {}", pair.lm_hash_hex);
            println!("NT: {}", pair.nt_hash_hex);
        }
    }

    Ok(())
}

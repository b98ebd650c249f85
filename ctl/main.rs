#![forbid(unsafe_code)]

//! `kernel-gateway-ctl`: command-line client for `kernel-gateway`.
//!
//! Sends requests to the gateway's HTTP API and prints the JSON responses.

use std::io::Read;

use clap::{Parser, Subcommand};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "kernel-gateway-ctl",
    about = "Command-line client for kernel-gateway",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the gateway's HTTP API.
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a kernel and print its id.
    Start {
        /// Kernel spec name; the server default is used when omitted.
        #[arg(long)]
        kernel: Option<String>,
    },

    /// Run code and print the execution result.
    Run {
        /// Kernel to run in; a new kernel is started when omitted.
        #[arg(long)]
        kernel_id: Option<String>,
        /// Code to run, or `-` to read it from stdin.
        code: String,
    },

    /// List running kernels.
    List,

    /// Shut a kernel down.
    Shutdown {
        /// Kernel id.
        id: String,
    },

    /// Interrupt the code a kernel is running.
    Interrupt {
        /// Kernel id.
        id: String,
    },
}

type CtlResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(dispatch(&args)) {
        Ok(Some(body)) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        }
        Ok(None) => println!("OK"),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

/// Translate a subcommand into an HTTP request and return the response body.
async fn dispatch(args: &Cli) -> CtlResult<Option<Value>> {
    let base = args.url.trim_end_matches('/');
    let client = Client::new();

    match &args.command {
        Command::Start { kernel } => {
            let body = json!({ "kernel_name": kernel });
            send(&client, Method::POST, &format!("{base}/kernels"), Some(body)).await
        }
        Command::Run { kernel_id, code } => {
            let code = if code == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                code.clone()
            };
            let body = json!({ "kernel_id": kernel_id, "code": code });
            send(&client, Method::POST, &format!("{base}/run-cell"), Some(body)).await
        }
        Command::List => send(&client, Method::GET, &format!("{base}/kernels"), None).await,
        Command::Shutdown { id } => {
            send(&client, Method::DELETE, &format!("{base}/kernels/{id}"), None).await
        }
        Command::Interrupt { id } => {
            let url = format!("{base}/kernels/{id}/interrupt");
            send(&client, Method::POST, &url, None).await
        }
    }
}

/// Send one request; non-2xx responses become errors carrying the server's
/// `detail` message.
async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> CtlResult<Option<Value>> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|err| format!("failed to reach kernel-gateway at {url}: {err}"))?;
    let status = response.status();

    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }

    let text = response.text().await?;
    let parsed: Option<Value> = serde_json::from_str(&text).ok();

    if status.is_success() {
        return Ok(Some(parsed.unwrap_or(Value::String(text))));
    }

    let detail = parsed
        .as_ref()
        .and_then(|v| v.get("detail"))
        .and_then(Value::as_str)
        .map_or(text.clone(), str::to_owned);
    Err(format!("{} {detail}", status.as_u16()).into())
}

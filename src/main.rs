//! # vigil
//!
//! Demo binary: instruments a small in-process "shop" module and prints the
//! finished transaction records as JSON lines.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use vigil::Agent;
use vigil_core::metadata::REQUEST_URI;
use vigil_core::RequestMetadata;
use vigil_hooks::{wrap_pass_function, Func};

/// Vigil instrumentation demo.
#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Run instrumented requests and print transaction records")]
struct Cli {
    /// Settings file (defaults to `~/.vigil/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Base request path.
    #[arg(long, default_value = "/orders/")]
    path: String,

    /// Number of requests to run.
    #[arg(long, default_value_t = 3)]
    requests: usize,

    /// Make every other request fail.
    #[arg(long)]
    fail: bool,
}

#[derive(Clone, Debug)]
struct Request {
    path: String,
    fail: bool,
}

#[derive(Clone, Debug, Serialize)]
struct Response {
    status: u16,
}

fn handle(request: Request) -> Response {
    let Some(txn) = vigil_transaction::current() else {
        return Response { status: 200 };
    };
    let _ = txn.add_custom_attribute("handler", "shop.views.handle");
    if request.fail {
        let _ = txn.notice_error("OrderError", format!("cannot load {}", request.path), None);
        return Response { status: 500 };
    }
    Response { status: 200 }
}

fn define_shop(agent: &Agent) {
    agent.modules().define("shop.views", |_, module| {
        let handler: Func<Request, Response> = Arc::new(handle);
        module.define("handle", handler);
        Ok(())
    });
}

fn instrument(agent: &Agent) -> Result<()> {
    agent.trace_function::<Request, Response, _>("shop.views", "handle", |request| {
        RequestMetadata::new().with(REQUEST_URI, request.path.clone())
    })?;

    // Registered second, so it wraps the traced handler and normalizes the
    // path before the transaction is named.
    agent.register_hook("shop.views", |module| {
        wrap_pass_function::<Request, Response>(
            module,
            "handle",
            Some(Arc::new(|mut request: Request| {
                let trimmed = request.path.trim_end_matches('/').len().max(1);
                request.path.truncate(trimmed);
                request
            })),
            None,
        )
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = match &args.settings {
        Some(path) => vigil_settings::load_settings_from_path(path),
        None => vigil_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let (agent, _telemetry) = Agent::start(settings).context("Failed to start agent")?;
    define_shop(&agent);
    instrument(&agent)?;

    let views = agent.import("shop.views")?;
    let handler = views
        .get::<Func<Request, Response>>("handle")
        .context("shop.views has no handler")?;

    for i in 0..args.requests {
        let request = Request {
            path: format!("{}{i}/", args.path),
            fail: args.fail && i % 2 == 1,
        };
        let response = (*handler)(request);
        tracing::info!(request = i, status = response.status, "request handled");
    }

    for record in agent.application().drain_finished() {
        println!("{}", serde_json::to_string(&record)?);
    }
    agent.shutdown();
    Ok(())
}

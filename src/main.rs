use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use rstream::{
    net, subscribe, Config, DefaultPublisherLookup, IterPublisher, ServerStack, StaticDiscovery,
};
use serde::Serialize;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the demo publishers
    Serve(ServeArgs),
    /// Subscribe to a stream and print its elements
    Subscribe(SubscribeArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value_t = String::from("127.0.0.1:1318"))]
    addr: String,

    #[arg(long, default_value_t = String::from("demo"))]
    service_name: String,
}

#[derive(Args)]
struct SubscribeArgs {
    /// e.g. stream://demo/counter?to=20
    uri: String,

    #[arg(long, default_value_t = String::from("127.0.0.1:1318"))]
    addr: String,

    #[arg(long, default_value_t = 8)]
    batch: u64,

    #[arg(long, default_value_t = String::from("rstream-cli"))]
    service_name: String,
}

#[derive(Serialize)]
struct Arg {
    key: String,
    value: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Subscribe(args) => run_subscribe(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let lookup = DefaultPublisherLookup::new();
    lookup.register(
        IterPublisher::new("/counter", |args: &rstream::Args| {
            let to = args.get("to").and_then(|v| v.parse().ok()).unwrap_or(10u64);
            0..to
        })
        .with_kind("counter"),
    );
    lookup.register(
        IterPublisher::new("/echo", |args: &rstream::Args| {
            args.iter()
                .map(|(key, value)| Arg {
                    key: key.to_owned(),
                    value: value.to_owned(),
                })
                .collect::<Vec<_>>()
        })
        .with_kind("echo"),
    );

    let stack = ServerStack::new(
        Arc::new(lookup),
        Config::new(args.service_name),
        Arc::new(StaticDiscovery::default()),
    );
    for op in stack.descriptor().operations {
        println!("serving {} {}", op.name, op.kind);
    }

    let listener = TcpListener::bind(&args.addr).await?;
    net::serve(listener, Arc::new(stack)).await
}

async fn run_subscribe(args: SubscribeArgs) -> Result<()> {
    let channel = net::connect(&args.addr).await?;
    let mut elements = subscribe(
        &args.uri,
        Arc::new(channel),
        &Config::new(args.service_name),
        &StaticDiscovery::default(),
        args.batch,
    )?;

    while let Some(element) = elements.next().await {
        println!("recv: {}", element?.value()?);
    }
    println!("EOF");

    Ok(())
}

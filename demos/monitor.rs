use std::env;

use vicare_bridge::{Bridge, Config, Event, ScheduleKind, StateStore, Trigger, keys};

/// Polls the appliance and prints events. Configured through `VICARE_*`.
///
///   monitor                 poll forever
///   monitor --login         print a PKCE login URL
///   monitor --code <code>   exchange a login code for tokens
///   monitor --boost         boost hot water once, then keep polling
#[tokio::main]
async fn main() -> vicare_bridge::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_env()?;

    let bridge = Bridge::builder(config)
        .on_event(|event| match event {
            Event::Failure { category, message } => eprintln!("[{category}] {message}"),
            other => println!("{other:?}"),
        })
        .build()?;

    if args.iter().any(|a| a == "--login") {
        bridge.handle(Trigger::GenerateAuthorizeUrl).await?;
        if let Some(url) = bridge.store().get_str(keys::AUTHORIZE_URL) {
            println!("Open in a browser and pass the returned code with --code:\n{url}");
        }
        return Ok(());
    }

    if let Some(pos) = args.iter().position(|a| a == "--code") {
        let code = args.get(pos + 1).cloned();
        bridge.handle(Trigger::ExchangeAuthorizationCode(code)).await?;
        println!("Tokens stored.");
        return Ok(());
    }

    let report = bridge.poll_once().await?;
    println!(
        "Using gateway {} device {} ({:?}, score {})",
        report.identity.gateway_id, report.identity.device_id, report.mode, report.score
    );

    if args.iter().any(|a| a == "--boost") {
        bridge.handle(Trigger::BoostNow(ScheduleKind::HotWater)).await?;
    }

    bridge.spawn_polling();
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("signal handler failed: {e}");
    }
    bridge.shutdown();
    Ok(())
}

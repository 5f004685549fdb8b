use std::process;

use tokio::runtime::Runtime;

use portico::app_context::AppContext;
use portico::proxy::rate_meter;

fn main() -> miette::Result<()> {
    let rt = Runtime::new().expect("Failed to build Tokio runtime");

    let Some(ctx) = rt.block_on(AppContext::bootstrap())? else {
        // --validate-configs: everything loaded and checked out.
        return Ok(());
    };

    let services = ctx.build_services()?;

    tracing::info!("Server running (PID: {})", process::id());

    let (mut server, meter) = ctx.ready();

    server.bootstrap();
    server.add_services(services);

    rt.spawn(async move { rate_meter::run_reaper(meter).await });

    tracing::info!("Starting Pingora Server...");

    server.run_forever();
}

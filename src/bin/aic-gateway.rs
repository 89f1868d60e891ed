#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: aic-gateway <config.json> [--listen HOST:PORT]")?;

    let mut listen = "127.0.0.1:8080".to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let raw = std::fs::read_to_string(&path)?;
    let config: aic_gateway::GatewayConfig = serde_json::from_str(&raw)?;

    let state = aic_gateway::GatewayState::initialize(config).await?;
    let app = aic_gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "aic-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

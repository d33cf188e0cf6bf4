use anyhow::Result;
use clap::Parser;
use tracing::info;

use policy_router::app::Engine;
use policy_router::common::Address;
use policy_router::router::metadata::RequestMetadata;

#[derive(Parser, Debug)]
#[command(name = "policy-router", version, about = "Rule-based proxy policy router")]
struct Cli {
    /// 配置文件路径
    #[arg(default_value = "config.yaml")]
    config: String,

    /// 只校验配置（含组环路检测）后退出
    #[arg(long)]
    check: bool,

    /// 对目标 host:port 做一次路由决策并打印结果
    #[arg(long, value_name = "HOST:PORT")]
    route: Option<String>,

    #[arg(long, default_value = "tcp")]
    network: String,

    /// 发起连接的进程路径
    #[arg(long, value_name = "PATH")]
    process: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = policy_router::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();
    info!(path = cli.config, "config loaded");

    let engine = Engine::build(&config)?;
    if cli.check {
        println!(
            "ok: {} proxies, {} groups, {} rules",
            engine.proxy_names().len(),
            engine.group_names().len(),
            engine.rules().len()
        );
        return Ok(());
    }

    if let Some(target) = cli.route.as_deref() {
        engine.refresh_rule_sets().await;
        engine.refresh_subscriptions().await;
        let addr: Address = target.parse()?;
        let mut meta = RequestMetadata::new(cli.network.as_str(), addr.host(), addr.port());
        if let Some(path) = cli.process {
            meta = meta.with_process(path);
        }
        let route = engine.route(&meta)?;
        match &route.rule {
            Some(rule) => println!("{} -> {} (rule: {})", target, route.policy, rule),
            None => println!("{} -> {} (default)", target, route.policy),
        }
        if let Some(group) = route.handler.as_group() {
            println!("  group {} now: {}", route.handler.name(), group.now().await);
        }
        engine.shutdown().await;
        return Ok(());
    }

    engine.start();
    info!("policy-router running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}

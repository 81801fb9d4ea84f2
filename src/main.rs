use anyhow::Result;
use clap::{Arg, Command};
use pacgrid::core::config::BotConfig;
use pacgrid::core::paper::{PaperConfig, PaperTransport};
use pacgrid::core::types::SymbolInfo;
use pacgrid::core::GatewayAdapter;
use pacgrid::engine::{IdlePlanner, TradingEngine};
use pacgrid::risk::auto_close::AutoCloseLimiter;
use pacgrid::risk::emergency::EmergencyStopLoss;
use pacgrid::risk::margin_guard::MarginGuard;
use pacgrid::risk::protection::ProtectionEngine;
use pacgrid::risk::session::SessionRiskManager;
use pacgrid::utils::notify::Notifier;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载环境变量
    dotenv::dotenv().ok();

    // 解析命令行参数
    let matches = Command::new("PacGrid")
        .version("0.1")
        .about("Pacifica永续合约风控交易引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .required(true),
        )
        .arg(
            Arg::new("symbol")
                .short('s')
                .long("symbol")
                .value_name("SYMBOL")
                .help("只跑指定交易对（覆盖配置文件）"),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();

    // 配置校验不通过直接拒绝启动
    let mut config = BotConfig::from_file(config_file)?;
    if let Some(symbol) = matches.get_one::<String>("symbol") {
        config.engine.symbols = vec![symbol.clone()];
    }

    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    log::info!(
        "启动 PacGrid: {:?}, 日志级别 {}",
        config.engine.symbols,
        config.log_level
    );

    // 纸面传输层：真实签名客户端通过库接口以 ExchangeTransport 注入
    let mut paper_config = PaperConfig::default();
    for symbol in &config.engine.symbols {
        paper_config.symbols.entry(symbol.clone()).or_insert(SymbolInfo {
            symbol: symbol.clone(),
            tick_size: 0.1,
            lot_size: 0.00001,
        });
    }
    let transport = Arc::new(PaperTransport::new(paper_config));
    for symbol in &config.engine.symbols {
        transport.set_mark_price(symbol, 50000.0).await;
    }

    let gateway = Arc::new(GatewayAdapter::new(transport, &config.gateway));
    let notifier = Arc::new(Notifier::new(config.notify.clone()));

    let emergency = Arc::new(EmergencyStopLoss::new(
        config.risk.emergency.clone(),
        gateway.clone(),
        config.engine.symbols.clone(),
    ));

    let engine = Arc::new(TradingEngine::new(
        config.engine.clone(),
        gateway,
        Arc::new(IdlePlanner),
        MarginGuard::new(config.risk.margin_guard.clone()),
        AutoCloseLimiter::new(config.risk.auto_close.clone()),
        ProtectionEngine::new(config.risk.protection.clone()),
        SessionRiskManager::new(config.risk.session.clone()),
        emergency.clone(),
        notifier,
    ));

    // 紧急看门狗独立运行，不受主循环状态影响
    let watchdog = tokio::spawn(emergency.run(engine.shutdown_receiver()));
    let runner = tokio::spawn(engine.clone().run());

    tokio::signal::ctrl_c().await?;
    log::info!("收到停止信号，正在关闭引擎...");
    engine.request_shutdown();

    let _ = runner.await;
    let _ = watchdog.await;
    log::info!("引擎已退出");
    Ok(())
}

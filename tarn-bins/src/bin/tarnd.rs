//! tarnd - the trading control plane daemon
//!
//! Wires the whole stack: broker adapter, event bus, account/order/
//! position managers, risk engine, strategy executor and the metrics
//! exporter, then runs until a shutdown signal.
//!
//! Exit codes: 0 on normal shutdown (and `--generate-config`), 1 on
//! configuration or connection failure and on runtime errors.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tarn_bins::common::init_logging;
use rust_decimal::prelude::ToPrimitive;
use tarn_core::broker::{BrokerAdapter, ConnectionState, ReconnectPolicy, Reconnector, SimBroker};
use tarn_core::config::AppConfig;
use tarn_core::event::{CoalescingProxy, EventBus, EventBusConfig, EventType};
use tarn_core::monitoring::{MetricsRegistry, MetricsServer, MetricsServerConfig};
use tarn_core::position::PositionManagerConfig;
use tarn_core::resilience::{install_panic_handler, Backoff, BackoffConfig, BreakerConfig, KillSwitch};
use tarn_core::risk::{RiskManager, RiskManagerConfig};
use tarn_core::session::is_trading_time;
use tarn_core::strategy::{ExecutorConfig, StrategyExecutor, StrategyRegistry};
use tarn_core::{AccountManager, OrderManager, PositionManager};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Tarn trading control plane")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "config/default.json")]
    config: PathBuf,

    /// Run against simulated fills instead of a live session
    #[arg(long)]
    backtest: bool,

    /// Backtest start date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,

    /// Backtest end date (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<String>,

    /// Log level
    #[arg(long, default_value = "info", value_parser = ["debug", "info", "warning", "error", "critical"])]
    log_level: String,

    /// Force debug logging
    #[arg(long)]
    debug: bool,

    /// Periodically log pipeline statistics
    #[arg(long)]
    profile: bool,

    /// Write a default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Broker connection attempts before giving up
    #[arg(long, default_value = "5")]
    max_retries: usize,

    /// Seconds between broker connection attempts
    #[arg(long, default_value = "5")]
    retry_interval: u64,

    /// Disable the metrics exporter
    #[arg(long)]
    disable_metrics: bool,

    /// Disable the event-bus circuit breaker
    #[arg(long)]
    disable_circuit_breaker: bool,

    /// Event-bus circuit breaker failure threshold
    #[arg(long)]
    circuit_breaker_threshold: Option<f64>,

    /// Trade even outside configured session windows
    #[arg(long)]
    force_trading: bool,

    /// Container-friendly output (JSON logs)
    #[arg(long)]
    container_mode: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.generate_config {
        return match AppConfig::write_default(&args.config) {
            Ok(()) => {
                println!("wrote default configuration to {}", args.config.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("failed to write configuration: {}", err);
                ExitCode::FAILURE
            }
        };
    }

    if let Err(err) = init_logging(&args.log_level, args.debug, args.container_mode) {
        eprintln!("failed to initialize logging: {}", err);
        return ExitCode::FAILURE;
    }
    install_panic_handler();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "tarnd exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    info!(
        account = %config.account.account_id,
        broker = %config.account.broker,
        backtest = args.backtest,
        "tarnd starting"
    );
    if args.backtest {
        info!(
            start = args.start_date.as_deref().unwrap_or("-"),
            end = args.end_date.as_deref().unwrap_or("-"),
            "simulated session with immediate fills"
        );
    }

    // Session gate: outside trading hours there is nothing to do
    if config.trading.enforce_trading_time && !args.backtest && !args.force_trading {
        let now = chrono::Local::now();
        if !is_trading_time(now, &config.trading.sessions, &config.trading.calendar) {
            warn!("outside configured trading sessions; exiting (use --force-trading to override)");
            return Ok(());
        }
    }

    // ------------------------------------------------------------------
    // Metrics registry (built first so the bus can feed its histogram)
    // ------------------------------------------------------------------
    let metrics = if config.monitoring.enabled && !args.disable_metrics {
        Some(MetricsRegistry::new().context("building metrics registry")?)
    } else {
        None
    };

    // ------------------------------------------------------------------
    // Event bus
    // ------------------------------------------------------------------
    let mut breaker = BreakerConfig::default();
    if let Some(threshold) = args.circuit_breaker_threshold {
        breaker.failure_threshold = threshold.max(1.0) as u64;
    }
    if args.disable_circuit_breaker {
        breaker.failure_threshold = u64::MAX;
    }
    let latency_hook = metrics.as_ref().map(|metrics| {
        let histogram = metrics.bus().handler_latency.clone();
        Arc::new(move |latency: Duration| histogram.observe(latency.as_secs_f64()))
            as tarn_core::event::LatencyHook
    });
    let bus = EventBus::with_handler_latency_hook(
        EventBusConfig {
            shard_count: config.event_bus.shard_count,
            queue_capacity: config.event_bus.queue_capacity,
            target_rate: config.event_bus.target_rate,
            io_workers: config.event_bus.io_workers,
            breaker,
            ..Default::default()
        },
        latency_hook,
    );

    // ------------------------------------------------------------------
    // Broker
    // ------------------------------------------------------------------
    let sim: Arc<SimBroker> = match config.account.broker.as_str() {
        "sim" => {
            let sim = Arc::new(SimBroker::new());
            if args.backtest {
                sim.set_immediate_fill(true);
            }
            sim
        }
        other => bail!("unknown broker adapter `{}`", other),
    };
    let broker: Arc<dyn BrokerAdapter> = sim.clone();

    connect_with_retry(
        broker.as_ref(),
        args.max_retries,
        Duration::from_secs(args.retry_interval),
    )?;

    // ------------------------------------------------------------------
    // Managers
    // ------------------------------------------------------------------
    let kill_switch = KillSwitch::new();
    {
        let kill_switch = kill_switch.clone();
        ctrlc::set_handler(move || {
            warn!("received interrupt, shutting down");
            kill_switch.shutdown("interrupt signal");
        })
        .context("installing signal handler")?;
    }

    let account = AccountManager::new(Default::default(), Arc::clone(&broker), bus.clone());

    let risk = RiskManager::new(
        RiskManagerConfig {
            parallel: config.risk.parallel,
            save_interval: Duration::from_secs(config.risk.save_interval_secs),
            persist_path: config.risk.persist_path.clone(),
            ..Default::default()
        },
        bus.clone(),
    );
    risk.set_broker(Arc::clone(&broker));
    for rule in &config.risk.rules {
        risk.add_rule(rule.clone());
    }

    let orders = OrderManager::new(
        tarn_core::order::OrderManagerConfig {
            track_interval: Duration::from_secs(config.orders.track_interval_secs),
            submit_timeout: Duration::from_secs(config.orders.submit_timeout_secs),
            max_retries: config.orders.max_retries,
            retry_interval: Duration::from_secs(config.orders.retry_interval_secs),
            ..Default::default()
        },
        Arc::clone(&broker),
        bus.clone(),
        kill_switch.clone(),
    );
    if config.trading.risk_checks_enabled {
        orders.set_risk_manager(Arc::new(risk.clone()));
    }
    orders.set_account_manager(account.clone());

    let positions = PositionManager::new(
        PositionManagerConfig {
            update_interval: Duration::from_secs(config.positions.update_interval_secs),
            limits: config.positions.limits.clone(),
            ..Default::default()
        },
        Arc::clone(&broker),
        bus.clone(),
        orders.clone(),
    );
    positions.set_account_manager(account.clone());

    let registry = StrategyRegistry::new();
    tarn_strategies::register_builtin(&registry);
    let executor = StrategyExecutor::new(
        ExecutorConfig {
            timer_interval: Duration::from_secs(config.executor.timer_interval_secs),
            scan_interval: Duration::from_secs(config.executor.scan_interval_secs),
            strategies_dir: resolve_strategies_dir(&args.config, &config),
            ..Default::default()
        },
        registry,
        orders.clone(),
        positions.clone(),
        account.clone(),
        Arc::clone(&broker),
        bus.clone(),
    );

    // ------------------------------------------------------------------
    // Metrics exporter
    // ------------------------------------------------------------------
    if let Some(registry) = &metrics {
        let listen_addr = config
            .monitoring
            .metrics_addr
            .parse()
            .context("parsing monitoring.metrics_addr")?;
        MetricsServer::new(MetricsServerConfig { listen_addr }, registry.clone()).spawn();
    }

    // ------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------
    let reconnector = Reconnector::new(Arc::clone(&broker), ReconnectPolicy::Unbounded);
    reconnector.start();

    // Market-data pump: the sim adapter has no push feed, so poll the
    // subscribed symbols and coalesce the resulting ticks into the bus
    let proxy = Arc::new(CoalescingProxy::new(Duration::from_millis(50), bus.sink()));
    proxy.start();
    let pump = {
        let sim = Arc::clone(&sim);
        let bus = bus.clone();
        let proxy = Arc::clone(&proxy);
        let kill_switch = kill_switch.clone();
        std::thread::Builder::new()
            .name("tarn-md-pump".into())
            .spawn(move || {
                while !kill_switch.should_stop() {
                    std::thread::sleep(Duration::from_millis(200));
                    for symbol in sim.subscribed_symbols() {
                        let Ok(quote) = sim.get_market_data(&symbol) else {
                            continue;
                        };
                        let event = bus
                            .acquire_event(EventType::MarketTick, "market_data")
                            .with_field("symbol", quote.symbol.clone())
                            .with_field("price", quote.last_price.to_f64().unwrap_or(0.0))
                            .with_field("bid", quote.bid.to_f64().unwrap_or(0.0))
                            .with_field("ask", quote.ask.to_f64().unwrap_or(0.0))
                            .with_field("volume", quote.volume)
                            .with_field("turnover", quote.turnover);
                        proxy.submit(event);
                    }
                }
            })
            .context("spawning market data pump")?
    };

    bus.start();
    account.start();
    orders.start();
    positions.start();
    executor.start();
    info!("tarnd running");

    let mut last_refresh = std::time::Instant::now();
    let mut last_profile = std::time::Instant::now();
    while !kill_switch.should_stop() {
        std::thread::sleep(Duration::from_millis(200));

        if let Some(metrics) = &metrics {
            if last_refresh.elapsed() >= Duration::from_secs(5) {
                metrics.refresh(&bus, &orders, &risk, &executor);
                last_refresh = std::time::Instant::now();
            }
        }
        if args.profile && last_profile.elapsed() >= Duration::from_secs(10) {
            let stats = bus.stats();
            info!(
                published = stats.published,
                dispatched = stats.dispatched,
                throughput = stats.throughput,
                batch = stats.batch_size,
                "pipeline profile"
            );
            last_profile = std::time::Instant::now();
        }
    }

    // ------------------------------------------------------------------
    // Shutdown: strategies first, bus last so events drain
    // ------------------------------------------------------------------
    info!("shutting down");
    let _ = pump.join();
    proxy.stop();
    executor.stop();
    let (cancelled, failed) = orders.cancel_all(None, None);
    if cancelled + failed > 0 {
        info!(cancelled, failed, "open orders cancelled on shutdown");
    }
    positions.stop();
    orders.stop();
    account.stop();
    reconnector.stop();
    if let Err(err) = risk.save_now() {
        warn!(%err, "final risk persistence failed");
    }
    bus.stop();
    broker.disconnect();
    info!("tarnd stopped");
    Ok(())
}

/// Connect with a bounded fixed-interval retry budget; a refused budget is
/// a startup failure (exit code 1).
fn connect_with_retry(
    broker: &dyn BrokerAdapter,
    max_retries: usize,
    interval: Duration,
) -> Result<()> {
    let mut backoff = Backoff::new(BackoffConfig::fixed(interval, max_retries));
    loop {
        match broker.connect() {
            Ok(()) => {
                if broker.wait_for_state(ConnectionState::Connected, Duration::from_secs(10)) {
                    return Ok(());
                }
                warn!("broker connect acknowledged but state never settled");
            }
            Err(err) => warn!(%err, "broker connection failed"),
        }
        match backoff.next_delay() {
            Some(delay) => std::thread::sleep(delay),
            None => bail!("could not connect to broker after {} attempts", max_retries + 1),
        }
    }
}

/// Strategies directory relative to the config file unless absolute.
fn resolve_strategies_dir(config_path: &std::path::Path, config: &AppConfig) -> PathBuf {
    let dir = &config.executor.strategies_dir;
    if dir.is_absolute() {
        return dir.clone();
    }
    config_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join(dir)
}

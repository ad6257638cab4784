// src/main.rs

use axum::{routing::post, serve, Router};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod api;
mod auction;
mod codec;
mod config;
mod crypto;
mod data;
mod error;
mod keys;
mod logging;
mod mock_auction;
mod model;
mod service;

use auction::buyer_input::BuyerInputGenerator;
use auction::filters::AdFilterer;
use chrono::{Duration, Utc};
use config::ServiceConfig;
use crypto::oblivious::ObliviousEncryptor;
use data::ad_selection::InMemoryAdSelectionStore;
use data::app_install::AppInstallStore;
use data::custom_audience::{CustomAudienceStore, InMemoryCustomAudienceStore};
use data::frequency_cap::HistogramStore;
use data::signals::{EncodedSignalsPayload, EncodedSignalsStore};
use keys::key_fetcher::HttpKeyFetcher;
use keys::key_manager::EncryptionKeyManager;
use logging::runtime_logger::RuntimeLogger;
use model::adtech::AdTechIdentifier;
use model::custom_audience::{AdData, CustomAudience};
use service::filter::RequestFilter;
use service::get_data::GetAdSelectionDataRunner;
use service::histogram_update::AdCounterHistogramUpdater;
use service::persist_result::PersistAdSelectionResultRunner;

/// 各 handler 共享的服务组件
pub struct AppState {
    pub runtime_logger: Arc<RuntimeLogger>,
    pub get_data_runner: Arc<GetAdSelectionDataRunner>,
    pub persist_runner: Arc<PersistAdSelectionResultRunner>,
    pub histogram_updater: Arc<AdCounterHistogramUpdater>,
}

#[derive(Parser, Debug)]
#[command(author = "whiteCcinn", version = "1.0", about = "A server-auction data exchange (ASDX) service")]
struct CliArgs {
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = 9001)]
    mock_auction_port: u16,
    #[arg(long, default_value = "logs")]
    log_dir: String,
    /// 可选的 JSON 配置文件，缺省用内置默认值
    #[arg(long)]
    config: Option<String>,
}

/// 预置几条演示用的自定义受众/安装登记/编码信号，让 mock 闭环能跑通
fn seed_demo_data(
    custom_audiences: &InMemoryCustomAudienceStore,
    app_installs: &AppInstallStore,
    signals: &EncodedSignalsStore,
) {
    let now = Utc::now();
    for (buyer, names) in [
        ("demo-buyer-a.com", ["running-shoes", "winter-coats"]),
        ("demo-buyer-b.com", ["used-cars", "travel-deals"]),
    ] {
        for (index, name) in names.iter().enumerate() {
            let render_id = format!("{name}-ad");
            custom_audiences.insert(CustomAudience {
                owner: "com.example.demo".into(),
                buyer: AdTechIdentifier::new(buyer),
                name: (*name).into(),
                activation_time: now - Duration::hours(1),
                expiration_time: now + Duration::days(7),
                priority: index as f64,
                trusted_bidding_keys: vec![format!("{name}-signals")],
                user_bidding_signals: "{}".into(),
                // 素材地址与 mock 竞价服务端的胜出地址约定一致
                ads: vec![AdData {
                    render_uri: format!("https://{buyer}/render/{render_id}"),
                    ad_render_id: render_id,
                    metadata: String::new(),
                    ad_counter_keys: [1, 2].into_iter().collect(),
                    filters: None,
                }],
            });
        }
    }
    app_installs.register(
        "com.example.demo",
        &[AdTechIdentifier::new("demo-buyer-a.com")],
    );
    signals.put(
        AdTechIdentifier::new("demo-buyer-b.com"),
        EncodedSignalsPayload {
            payload: vec![0x02, 0x11, 0x47],
            encoding_version: 1,
        },
    );
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // 初始化全局 tracing 日志
    let log_file = rolling::hourly(&args.log_dir, "asdx_log.json");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);
    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().json().with_writer(non_blocking));
    tracing::subscriber::set_global_default(subscriber)
        .expect("Unable to set global tracing subscriber");
    info!("ASDX server starting on port {}", args.port);

    // 配置：文件可选，协调方默认指向本地 mock
    let mut service_config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("Unable to read config file");
            serde_json::from_str::<ServiceConfig>(&text).expect("Unable to parse config file")
        }
        None => ServiceConfig::default(),
    };
    if args.config.is_none() {
        service_config.default_coordinator_origin =
            format!("http://127.0.0.1:{}", args.mock_auction_port);
    }
    let service_config = Arc::new(service_config);

    // 启动 Mock 竞价服务端（监听 9001 端口，同时充当协调方发公钥）
    let mock_server = mock_auction::MockAuctionServer::generate();
    let mock_auction_server = tokio::spawn({
        let mock_server = mock_server.clone();
        let port = args.mock_auction_port;
        async move {
            mock_auction::start_mock_auction_server(port, mock_server).await;
        }
    });

    // 初始化运行日志记录器（审计日志）
    let runtime_logger = RuntimeLogger::new(&args.log_dir, 1000, 100, 1000);

    // 存储层
    let custom_audience_store = Arc::new(InMemoryCustomAudienceStore::new());
    let app_install_store = Arc::new(AppInstallStore::new());
    let signals_store = Arc::new(EncodedSignalsStore::new());
    let ad_selection_store = Arc::new(InMemoryAdSelectionStore::new());
    let histogram = Arc::new(HistogramStore::new(service_config.histogram_limits()));
    seed_demo_data(&custom_audience_store, &app_install_store, &signals_store);

    // 组件装配
    let filterer = Arc::new(AdFilterer::new(
        service_config.frequency_cap_filtering_enabled,
        service_config.app_install_filtering_enabled,
        histogram.clone(),
        app_install_store.clone(),
    ));
    let buyer_input_generator = Arc::new(BuyerInputGenerator::new(
        custom_audience_store.clone() as Arc<dyn CustomAudienceStore>,
        signals_store.clone(),
        filterer,
        service_config.compressor(),
        service_config.seller_configuration_enabled,
        service_config.per_buyer_signals_max_size_bytes,
    ));
    let key_manager = Arc::new(EncryptionKeyManager::new(
        service_config.coordinator_policy(),
        Arc::new(HttpKeyFetcher::new(
            service_config.key_fetch_timeout_ms,
            service_config.key_max_age_seconds,
        )),
    ));
    let encryptor = Arc::new(ObliviousEncryptor::new());
    let request_filter = Arc::new(RequestFilter::new());

    let get_data_runner = Arc::new(GetAdSelectionDataRunner::new(
        service_config.clone(),
        request_filter.clone(),
        buyer_input_generator,
        key_manager,
        encryptor.clone(),
        ad_selection_store.clone(),
    ));
    let persist_runner = Arc::new(PersistAdSelectionResultRunner::new(
        service_config.clone(),
        request_filter,
        encryptor,
        ad_selection_store.clone(),
        custom_audience_store.clone() as Arc<dyn CustomAudienceStore>,
        histogram.clone(),
    ));
    let histogram_updater = Arc::new(AdCounterHistogramUpdater::new(
        ad_selection_store,
        histogram,
    ));

    let state = Arc::new(AppState {
        runtime_logger,
        get_data_runner,
        persist_runner,
        histogram_updater,
    });

    let asdx_server = tokio::spawn({
        let state = state.clone();
        let port = args.port;
        async move {
            let app = Router::new()
                .route(
                    "/adSelection/getAdSelectionData",
                    post(api::handlers::handle_get_ad_selection_data),
                )
                .route(
                    "/adSelection/persistAdSelectionResult",
                    post(api::handlers::handle_persist_ad_selection_result),
                )
                .route(
                    "/adSelection/updateAdCounterHistogram",
                    post(api::handlers::handle_update_ad_counter_histogram),
                )
                .with_state(state);
            let addr = format!("0.0.0.0:{}", port);
            info!("ASDX server running at http://{}", addr);
            let listener = TcpListener::bind(&addr).await.unwrap();
            serve(listener, app).await.unwrap();
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutting down gracefully...");
        }
    }

    asdx_server.abort();
    mock_auction_server.abort();
    info!("ASDX server shut down.");
}

use std::io::Read as _;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::MatchedPath;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use synap_forge_serve::cli::{Cli, Command};
use synap_forge_serve::core::cache_manager::CacheManager;
use synap_forge_serve::core::coordinator::{ChatMessage, GenerationCoordinator, GenerationRequest};
use synap_forge_serve::core::load_model::initialise_model;
use synap_forge_serve::core::rate_limiter::RateLimiter;
use synap_forge_serve::openai::http_service::{
    create_chat_completion, create_completion, health, list_models, AppState,
};

fn init_tracing(verbose: u8) {
    let debug = verbose > 0
        || std::env::var("SYNAP_FORGE_DEBUG")
            .map(|v| v != "0")
            .unwrap_or(false);
    let default_directive = if debug {
        "synap_forge_serve=debug,tower_http=debug,axum::rejection=trace"
    } else {
        "synap_forge_serve=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_router(state: AppState) -> Router {
    let cors = if state.cfg.cors_allow_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION])
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .cfg
            .cors_allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION])
    };

    let v1 = Router::new()
        .route("/chat/completions", post(create_chat_completion))
        .route("/completions", post(create_completion))
        .route("/models", get(list_models));

    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1)
        .with_state(state)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let matched_path = request.extensions().get::<MatchedPath>().map(MatchedPath::as_str);
                    info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        matched_path = matched_path,
                    )
                })
                .on_request(|request: &Request<_>, _span: &Span| {
                    info!(method = %request.method(), uri = %request.uri(), "request started");
                })
                .on_response(|response: &Response, latency: Duration, _span: &Span| {
                    info!(status = %response.status(), ?latency, "request completed");
                })
                .on_failure(
                    |failure: ServerErrorsFailureClass, latency: Duration, _span: &Span| {
                        error!(?failure, ?latency, "request failed");
                    },
                ),
        )
}

async fn run_serve(args: synap_forge_serve::cli::ServeArgs) -> anyhow::Result<()> {
    let cfg = args.into_server_config();
    let token = std::env::var("HF_TOKEN").ok();
    if let Some(dir) = synap_forge_serve::cli::cache_dir_override() {
        info!(cache_dir = %dir.display(), "using overridden model cache directory");
    }

    let before = Instant::now();
    info!(model_id = %cfg.model_id, "loading model");
    let model = Arc::new(initialise_model(token, &cfg)?);
    info!(elapsed = ?before.elapsed(), "model loaded");

    let cache_manager = Arc::new(CacheManager::new(
        cfg.max_cache_entries,
        cfg.max_retained_cache_tokens,
        cfg.generation_slots,
        cfg.max_queue_depth,
    ));
    let rate_limiter = cfg.rate_limit_per_minute.map(|n| Arc::new(RateLimiter::new(n)));
    let cfg = Arc::new(cfg);
    let coordinator = Arc::new(GenerationCoordinator::new(
        Arc::clone(&model),
        Arc::clone(&cache_manager),
        (*cfg).clone(),
    ));

    let state = AppState {
        coordinator,
        model,
        cfg: Arc::clone(&cfg),
        rate_limiter,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    info!(host = %cfg.host, port = cfg.port, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

async fn run_once(args: synap_forge_serve::cli::RunArgs) -> anyhow::Result<()> {
    let prompt = if args.stdin {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        args.prompt
            .clone()
            .ok_or_else(|| anyhow::anyhow!("a prompt argument or --stdin is required"))?
    };

    let cfg = args.into_server_config();
    let token = std::env::var("HF_TOKEN").ok();
    let model = Arc::new(initialise_model(token, &cfg)?);
    let cache_manager = Arc::new(CacheManager::new(1, 0, 1, 1));
    let coordinator = GenerationCoordinator::new(Arc::clone(&model), cache_manager, cfg.clone());

    let params = synap_forge_serve::config::GenerationParams::merge(
        &cfg,
        Some(args.max_tokens),
        Some(args.temperature),
        Some(args.top_p),
        None,
        None,
        None,
        None,
        None,
        args.seed,
        Vec::new(),
        false,
        None,
    )?;
    let gen_req = GenerationRequest {
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: prompt,
        }],
        tool_schema: None,
        response_format: None,
        params,
        tool_parser: cfg.tool_call_parser,
        raw_mode: cfg.raw_mode,
        fix_tool_args: cfg.fix_tool_args,
    };

    if args.stream {
        let coordinator = Arc::new(coordinator);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut rx = coordinator.generate_stream(gen_req, cancel);
        use std::io::Write;
        while let Some(event) = rx.recv().await {
            match event {
                synap_forge_serve::core::coordinator::StreamEvent::Delta { content, .. } => {
                    if let Some(text) = content {
                        print!("{text}");
                        std::io::stdout().flush().ok();
                    }
                }
                synap_forge_serve::core::coordinator::StreamEvent::Done { .. } => {
                    println!();
                    break;
                }
                synap_forge_serve::core::coordinator::StreamEvent::Error(err) => {
                    return Err(anyhow::anyhow!(err.to_string()));
                }
            }
        }
    } else {
        let cancel = Arc::new(AtomicBool::new(false));
        let result = coordinator.generate(gen_req, cancel).await?;
        println!("{}", result.visible);
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Serve(args) => args.model.verbose,
        Command::Run(args) => args.model.verbose,
    };
    init_tracing(verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Serve(args) => run_serve(args).await,
            Command::Run(args) => run_once(args).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

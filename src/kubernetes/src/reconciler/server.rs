use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{
    get, middleware,
    web::Data,
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use kube::Client;
use prometheus::{Encoder, TextEncoder};

use rosterd_trace::init::{prepare_tracing, TraceConfig};

use crate::config::IPAMConfig;
use crate::context::State;
use crate::reconciler::cron;
use crate::store::kubernetes::KubeDatastore;

pub const DEFAULT_NAMESPACE: &str = "rosterd-system";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: PathBuf,
    pub namespace: String,
    pub http_port: u16,
}

pub fn start(config: Config, trace: TraceConfig) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(config, trace));
}

#[tracing::instrument(skip_all)]
async fn run(config: Config, trace_config: TraceConfig) {
    prepare_tracing(&trace_config);

    let ipam_config = match IPAMConfig::from_flatfile(&config.config_file) {
        Ok(conf) => conf,
        Err(e) => {
            tracing::error!(error = %e, path = %config.config_file.display(), "failed to load the configuration");
            std::process::exit(1);
        }
    };
    let schedule = match cron::parse_schedule(&ipam_config.reconciler_cron_expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            tracing::error!(error = %e, "invalid reconciler cron expression");
            std::process::exit(1);
        }
    };

    let client = match &ipam_config.kubernetes.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .expect("Failed to read the kubeconfig");
            let kube_config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .expect("Failed to interpret the kubeconfig");
            Client::try_from(kube_config).expect("Failed to create kube client")
        }
        None => Client::try_default()
            .await
            .expect("Failed to create kube client"),
    };
    let namespace = ipam_config
        .kubernetes
        .namespace
        .clone()
        .unwrap_or_else(|| config.namespace.clone());
    let store = Arc::new(KubeDatastore::new(client, &namespace));

    let state = State::new("reconciler");
    let ctx = state.to_context(store);

    tracing::info!(
        schedule = %ipam_config.reconciler_cron_expression,
        "Start the IP reconciler"
    );
    tokio::spawn(cron::run(ctx, schedule, Some(config.config_file.clone())));

    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind(("0.0.0.0", config.http_port))
    .expect("failed to bind the metrics endpoint")
    .shutdown_timeout(5);

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "web server terminated");
    }
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&metrics, &mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

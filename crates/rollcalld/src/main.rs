use anyhow::{Context, Result};
use rollcall_core::{ContactDirectory, IdentityStore, ScrfdDetector, SharedModel};
use rollcall_hw::Camera;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod attendance;
mod config;
mod dbus_interface;
mod enrollment;
mod handoff;
mod kiosk;
mod mailer;
mod observer;
mod otp;
mod pipeline;
#[cfg(test)]
mod testing;

use attendance::{Attendance, FormEndpoint};
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use enrollment::{Enroller, EnrollmentSettings};
use handoff::FrameSlot;
use kiosk::{Kiosk, KioskSettings};
use mailer::SmtpMailer;
use observer::{BusObserver, Observer};
use pipeline::{FramePipeline, PipelineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    // Startup resources fail fast.
    let store = Arc::new(
        IdentityStore::open(&config.data_dir).context("identity directory is unusable")?,
    );
    let contacts = Arc::new(ContactDirectory::load(store.dir()));
    let model = Arc::new(SharedModel::default());
    let trained = enrollment::retrain(&store, &model).context("failed to load reference samples")?;
    tracing::info!(samples = trained, "initial recognizer trained");

    let scrfd_path = config.scrfd_model_path();
    let pipeline_detector = ScrfdDetector::load(&scrfd_path)
        .with_context(|| format!("failed to load detector model {scrfd_path}"))?;
    let enrollment_detector = ScrfdDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;

    if config.form.post_url.is_empty() {
        tracing::warn!("ROLLCALL_FORM_POST_URL is not set; attendance submissions will fail");
    }

    let runtime = tokio::runtime::Handle::current();
    let (bus_observer, mut notifications) = BusObserver::new();
    let observer: Arc<dyn Observer> = Arc::new(bus_observer);
    let stop = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(FrameSlot::new());

    let attendance = Arc::new(Attendance::new(
        config.cooldown,
        FormEndpoint::new(config.form.clone())?,
        runtime.clone(),
        Arc::clone(&observer),
    ));

    let enroller = Arc::new(Enroller::new(
        Arc::clone(&store),
        Arc::clone(&model),
        Arc::clone(&slot),
        Box::new(enrollment_detector),
        Arc::clone(&observer),
        Arc::clone(&stop),
        EnrollmentSettings {
            countdown_ticks: config.countdown_ticks,
            capture_interval: config.capture_interval,
            ..EnrollmentSettings::default()
        },
    ));

    let kiosk = Arc::new(Kiosk::new(
        store,
        contacts,
        SmtpMailer::new(&config.smtp).context("failed to set up SMTP transport")?,
        enroller,
        runtime,
        Arc::clone(&observer),
        KioskSettings {
            register_samples: config.samples_per_user,
            update_samples: config.update_samples,
        },
    ));

    let pipeline = FramePipeline::new(
        Box::new(pipeline_detector),
        model,
        attendance,
        Arc::clone(&slot),
        PipelineSettings::new(config.recognition_threshold, config.frame_reduce_factor),
    )
    .spawn(Box::new(camera), Arc::clone(&stop))?;

    let service = KioskService::new(kiosk, slot, config.camera_device.clone());
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    tokio::spawn(async move {
        while let Some(n) = notifications.recv().await {
            let duration_ms = n.duration.as_millis() as u64;
            if let Err(e) =
                KioskService::notification(&emitter, n.kind.as_str(), &n.message, duration_ms).await
            {
                tracing::debug!(error = %e, "failed to emit notification signal");
            }
        }
    });

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // In-flight submissions and mail are not awaited.
    let timeout = config.shutdown_timeout;
    tokio::task::spawn_blocking(move || pipeline.shutdown(timeout)).await?;
    drop(conn);

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Input;
use std::path::PathBuf;

// `#[zbus::proxy]` generates `KioskProxy` (async) and `KioskProxyBlocking`.
#[zbus::proxy(
    interface = "org.rollcall.Kiosk1",
    default_service = "org.rollcall.Kiosk1",
    default_path = "/org/rollcall/Kiosk1"
)]
trait Kiosk {
    async fn register(&self, name: &str, employee_id: &str, email: &str) -> zbus::Result<()>;
    async fn request_update(&self, employee_id: &str) -> zbus::Result<String>;
    async fn submit_email(&self, employee_id: &str, email: &str) -> zbus::Result<()>;
    async fn verify_otp(&self, employee_id: &str, code: &str) -> zbus::Result<bool>;
    async fn resend_otp(&self, employee_id: &str) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn snapshot(&self) -> zbus::Result<Vec<u8>>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance kiosk CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new employee and capture their reference photos
    Register {
        #[arg(short, long)]
        name: String,
        /// Employee id (must not contain '_')
        #[arg(short, long)]
        employee_id: String,
        /// Address OTPs are sent to for later photo updates
        #[arg(long)]
        email: String,
    },
    /// Update an employee's photos (interactive OTP verification)
    Update { employee_id: String },
    /// Submit an OTP for a pending photo update
    Verify { employee_id: String, code: String },
    /// Send a new OTP, invalidating the previous one
    Resend { employee_id: String },
    /// Show daemon status
    Status,
    /// Save the latest annotated camera frame as PNG
    Snapshot {
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,
    },
    /// List local V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register {
            name,
            employee_id,
            email,
        } => {
            connect().await?.register(&name, &employee_id, &email).await?;
            println!("Registration started for {employee_id}. Look at the camera.");
        }
        Commands::Update { employee_id } => update(&connect().await?, &employee_id).await?,
        Commands::Verify { employee_id, code } => {
            if connect().await?.verify_otp(&employee_id, &code).await? {
                println!("Verified. Photo update started; look at the camera.");
            } else {
                println!("Incorrect OTP");
                std::process::exit(1);
            }
        }
        Commands::Resend { employee_id } => {
            connect().await?.resend_otp(&employee_id).await?;
            println!("New OTP sent");
        }
        Commands::Status => {
            let status = connect().await?.status().await?;
            let parsed: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Commands::Snapshot { output } => {
            let png = connect().await?.snapshot().await?;
            std::fs::write(&output, png)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!("Saved {}", output.display());
        }
        Commands::Devices => {
            // Local diagnostics, no daemon needed.
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<KioskProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    KioskProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

/// Walk the operator through email entry and OTP verification.
async fn update(proxy: &KioskProxy<'_>, employee_id: &str) -> Result<()> {
    if proxy.request_update(employee_id).await? == "email-required" {
        let email: String = Input::new()
            .with_prompt("No email on file. Email address")
            .interact_text()?;
        proxy.submit_email(employee_id, &email).await?;
    }
    println!("OTP sent.");

    loop {
        let code: String = Input::new()
            .with_prompt("6-digit OTP (or 'resend')")
            .interact_text()?;
        let code = code.trim();
        if code.eq_ignore_ascii_case("resend") {
            proxy.resend_otp(employee_id).await?;
            println!("New OTP sent.");
            continue;
        }
        if proxy.verify_otp(employee_id, code).await? {
            println!("Verified. Photo update started; look at the camera.");
            return Ok(());
        }
        println!("Incorrect, try again.");
    }
}

use std::time::Duration;

use background_processor::{Backoff, JobOptions, JobQueue, ProcessorConfig, Schedule};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct SendEmailArgs {
    to: String,
    subject: String,
}

async fn send_email(args: SendEmailArgs) -> Result<(), String> {
    tracing::info!(to = %args.to, subject = %args.subject, "Sending email");
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessPaymentArgs {
    order_id: String,
    amount: f64,
}

#[derive(Debug, Serialize)]
struct PaymentReceipt {
    order_id: String,
    charged: f64,
}

async fn process_payment(args: ProcessPaymentArgs) -> Result<PaymentReceipt, String> {
    if args.amount > 1000.0 {
        return Err("Requires manual review".to_string());
    }
    Ok(PaymentReceipt {
        order_id: args.order_id,
        charged: args.amount,
    })
}

async fn cleanup(_: ()) -> Result<(), String> {
    tracing::info!("Running cleanup");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Optional `bgproc.toml` plus BGPROC__* overrides
    let config = ProcessorConfig::load(Some("bgproc.toml"))?;
    let queue = JobQueue::sqlite("sqlite://jobs.db?mode=rwc", config).await?;

    let send_email_job = queue.register_handler("email:send", send_email);
    let payment_job = queue
        .register_handler("payment:process", process_payment)
        .on_queue("high-priority")
        .with_options(
            JobOptions::new()
                .max_attempts(5)
                .timeout(Duration::from_secs(30))
                .backoff(Backoff::exponential(Duration::from_secs(2))),
        );
    let cleanup_job = queue
        .register_handler("maintenance:cleanup", cleanup)
        .on_queue("maintenance");

    queue.start();

    // Fire-and-forget
    send_email_job
        .enqueue(SendEmailArgs {
            to: "user@example.com".to_string(),
            subject: "Welcome!".to_string(),
        })
        .await?;

    // Delayed job
    send_email_job
        .schedule(
            SendEmailArgs {
                to: "user@example.com".to_string(),
                subject: "Reminder".to_string(),
            },
            Duration::from_secs(30),
        )
        .await?;

    // Recurring job, top of every hour
    cleanup_job
        .recurring("0 * * * *".parse::<Schedule>()?, ())
        .await?;

    // Untyped call with an explicit priority
    queue
        .add_job(
            "high-priority",
            "payment:process",
            ProcessPaymentArgs {
                order_id: "ORD-123".to_string(),
                amount: 99.99,
            },
            JobOptions::new().priority(10),
        )
        .await?;
    payment_job
        .enqueue(ProcessPaymentArgs {
            order_id: "ORD-124".to_string(),
            amount: 2500.0,
        })
        .await?;

    tracing::info!("Running. Press Ctrl+C to stop.");
    queue.wait_for_shutdown().await;

    for name in queue.queues() {
        let stats = queue.get_queue_stats(&name).await;
        tracing::info!(queue = %name, ?stats, "Final queue stats");
    }

    Ok(())
}

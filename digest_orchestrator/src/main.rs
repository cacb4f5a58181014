//! Main entry point for the digest orchestrator CLI.

use anyhow::{Context, Result};
use clap::Parser;
use digest_orchestrator::{
    cli, settings::Settings, telemetry, DigestRequest, EngagementEvent, Orchestrator, SignalType,
    WorkflowOutcome,
};

const DIGEST_HISTORY_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    telemetry::init(&settings.logging)?;

    tokio::select! {
        result = execute(args.command, settings) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, abandoning in-flight run");
            Ok(())
        }
    }
}

async fn execute(command: cli::Commands, settings: Settings) -> Result<()> {
    match command {
        cli::Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        cli::Commands::Run {
            user,
            prompt,
            topics,
            max_articles,
        } => {
            let deadline = settings.orchestrator.run_deadline();
            let orchestrator = Orchestrator::offline(settings);
            let mut request = DigestRequest::default()
                .with_topics(topics)
                .with_max_articles(max_articles);
            if let Some(prompt) = prompt {
                request = request.with_prompt(prompt);
            }
            let outcome = orchestrator.run_with_deadline(&user, request, deadline).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        cli::Commands::Simulate {
            user,
            topic,
            rating,
        } => {
            let deadline = settings.orchestrator.run_deadline();
            let orchestrator = Orchestrator::offline(settings);
            let before = orchestrator.get_profile(&user).await;

            let request = DigestRequest::default().with_topics([topic.as_str()]);
            let outcome = orchestrator.run_with_deadline(&user, request, deadline).await?;
            let content = match outcome {
                WorkflowOutcome::Completed { content, .. } => content,
                WorkflowOutcome::Aborted(reason) => {
                    anyhow::bail!("digest generation aborted: {:?}", reason)
                }
            };

            let event = EngagementEvent::new(&user, &content.content_id, SignalType::Rating, rating);
            let after = orchestrator
                .record_event(&user, event)
                .await
                .context("failed to record rating")?;

            let report = serde_json::json!({
                "content_id": content.content_id,
                "title": content.title,
                "topics": content.topics,
                "profile_before": before,
                "profile_after": after,
                "engagement": orchestrator.engagement_stats(&user).await,
                "history": orchestrator.digest_history(&user, DIGEST_HISTORY_LIMIT),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

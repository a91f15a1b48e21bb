use anyhow::{bail, Context, Result};
use askline_core::{
    telemetry, ClientSettings, CredentialBundle, HttpTransport, InMemoryCredentialProvider,
    QueryError, QueryHandlers, QueryOutcome, QueryRequest, QuerySummary, ReplayTransport,
    SessionRuntime,
};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;
use url::Url;
use uuid::Uuid;

const ACCESS_TOKEN_ENV: &str = "ASKLINE_ACCESS_TOKEN";
const REFRESH_TOKEN_ENV: &str = "ASKLINE_REFRESH_TOKEN";

const SMOKE_STREAM: &[u8] = b"event: connected\n\
data: {\"conversationId\":\"smoke\"}\n\
event: token\n\
data: \"Askline\"\n\
data: \"is\"\n\
data: \"alive\"\n\
event: citations\n\
data: [{\"id\":\"smoke-doc\"}]\n\
data: [DONE]\n";

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Askline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a canned answer stream through a signed-in session.
    Smoke,
    /// Ask a live endpoint one question using a token from the environment.
    Ask {
        question: String,
        /// Overrides the endpoint from askline.yaml.
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long, default_value = "xtask")]
        client: String,
    },
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::env_filter_or("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
        Commands::Ask {
            question,
            endpoint,
            conversation,
            client,
        } => ask(question, endpoint, conversation, client),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let provider = InMemoryCredentialProvider::signed_in();
    let app = SessionRuntime::new(
        ClientSettings::default(),
        Arc::new(provider),
        Arc::new(ReplayTransport::chunked(SMOKE_STREAM, 16)),
    );

    let outcome = runtime.block_on(async {
        if !app.sign_in("smoke-user", Some("tester".into())).await {
            bail!("smoke sign-in failed: {:?}", app.session().snapshot().last_error);
        }
        let request = QueryRequest::new("xtask", "smoke", "Is Askline alive?");
        let outcome = app.query(request, ()).wait().await;
        app.sign_out();
        Ok(outcome)
    })?;

    match outcome {
        QueryOutcome::Completed(summary) => {
            info!(
                tokens = summary.tokens,
                citations = summary.citations.len(),
                answer = %summary.answer.trim_end(),
                "smoke query completed"
            );
            Ok(())
        }
        QueryOutcome::Failed(err) => Err(err).context("smoke query failed"),
        QueryOutcome::Aborted => bail!("smoke query aborted"),
    }
}

/// Prints fragments as they arrive.
struct ConsoleHandlers;

impl QueryHandlers for ConsoleHandlers {
    fn on_token(&mut self, text: &str) {
        print!("{text} ");
        std::io::stdout().flush().ok();
    }

    fn on_citations(&mut self, citations: &[Value]) {
        println!();
        for citation in citations {
            println!("  [source] {citation}");
        }
    }

    fn on_done(&mut self, _summary: &QuerySummary) {
        println!();
    }

    fn on_error(&mut self, error: &QueryError) {
        eprintln!("\nquery failed: {error}");
    }
}

fn ask(
    question: String,
    endpoint: Option<String>,
    conversation: Option<String>,
    client: String,
) -> Result<()> {
    dotenvy::dotenv().ok();
    let settings =
        ClientSettings::load_or_default().map_err(|err| anyhow::anyhow!(err.user_message()))?;
    let endpoint = match endpoint {
        Some(raw) => Url::parse(&raw).with_context(|| format!("invalid endpoint `{raw}`"))?,
        None => settings
            .require_endpoint()
            .map_err(|err| anyhow::anyhow!(err.user_message()))?
            .clone(),
    };

    let access_token = std::env::var(ACCESS_TOKEN_ENV)
        .with_context(|| format!("{ACCESS_TOKEN_ENV} must hold a bearer token"))?;
    let refresh_token = std::env::var(REFRESH_TOKEN_ENV).unwrap_or_default();
    let bundle =
        CredentialBundle::new(access_token, refresh_token, Utc::now(), Duration::hours(1));
    let provider = InMemoryCredentialProvider::with_bundle(bundle);

    let runtime = Runtime::new()?;
    let app = SessionRuntime::new(
        settings,
        Arc::new(provider),
        Arc::new(HttpTransport::new(endpoint)),
    );
    let conversation = conversation.unwrap_or_else(|| Uuid::new_v4().to_string());

    let outcome = runtime.block_on(async {
        if !app.sign_in(client.clone(), None).await {
            bail!("sign-in failed");
        }
        let request = QueryRequest::new(client, conversation, question);
        let outcome = app.query(request, ConsoleHandlers).wait().await;
        app.sign_out();
        Ok(outcome)
    })?;

    match outcome {
        QueryOutcome::Completed(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        QueryOutcome::Failed(err) => Err(err).context("query failed"),
        QueryOutcome::Aborted => bail!("query aborted"),
    }
}

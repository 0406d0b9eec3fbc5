use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use clap::Parser;
use futures_util::StreamExt;
use parley_inference::{
    load_inference_config, ChunkAccumulator, ContentPart, ConversionRequest, HttpImageFetcher,
    InferenceConfig, InferenceService, Message, ProviderRegistry,
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_FILE: &str = "parley.toml";

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Stream one answer from any configured LLM provider")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    provider: String,
    #[arg(long)]
    model: String,
    #[arg(long)]
    system: Option<String>,
    /// Image URL to attach to the prompt; may be repeated.
    #[arg(long = "image")]
    images: Vec<String>,
    #[arg(long, default_value_t = false)]
    show_thinking: bool,
    /// Print every unified chunk as one JSON line instead of plain text.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    test_mode: bool,
    #[arg(long)]
    log_level: Option<String>,
    /// Write logs here instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    prompt: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref(), cli.log_file.as_deref());
    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing(level: Option<&str>, log_file: Option<&Path>) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let env_filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let init_result = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "parley.log".to_string());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = TRACE_GUARD.set(guard);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .try_init()
        }
        None => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init(),
    };
    if let Err(error) = init_result {
        eprintln!("warning: failed to initialize tracing subscriber: {error}");
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut config = load_config(cli.config.as_deref())?;
    config.test_mode |= cli.test_mode;

    let registry = ProviderRegistry::from_config(&config).map_err(|error| error.to_string())?;
    let service = InferenceService::new(Arc::new(registry))
        .with_image_fetcher(Arc::new(HttpImageFetcher::default()));

    let request = build_request(&cli)?;
    info!(provider = %cli.provider, model = %cli.model, "sending prompt");
    let mut stream = service
        .answer(&cli.provider, request)
        .await
        .map_err(|error| error.as_compact_json())?;

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let mut accumulator = ChunkAccumulator::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| error.as_compact_json())?;
        accumulator.push(&chunk);

        if cli.json {
            let line = serde_json::to_string(&chunk).map_err(|error| error.to_string())?;
            writeln!(stdout, "{line}").map_err(|error| error.to_string())?;
            continue;
        }
        if cli.show_thinking {
            if let Some(thinking) = &chunk.thinking_delta {
                write!(stderr, "{thinking}").map_err(|error| error.to_string())?;
            }
        }
        if let Some(text) = &chunk.text_delta {
            write!(stdout, "{text}").map_err(|error| error.to_string())?;
            stdout.flush().map_err(|error| error.to_string())?;
        }
    }

    let turn = accumulator.finish();
    if !cli.json {
        writeln!(stdout).map_err(|error| error.to_string())?;
        for call in &turn.tool_calls {
            eprintln!("[tool call] {} {} {}", call.id, call.name, call.raw_arguments);
        }
        eprintln!(
            "[{}] input tokens: {}, output tokens: {}",
            turn.finish_reason
                .as_ref()
                .map(|reason| reason.as_str())
                .unwrap_or("unknown"),
            format_tokens(turn.usage.input_tokens),
            format_tokens(turn.usage.output_tokens),
        );
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<InferenceConfig, String> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                return Ok(InferenceConfig {
                    test_mode: parley_inference::test_mode_from_env(),
                    ..InferenceConfig::default()
                });
            }
            default
        }
    };
    load_inference_config(&path).map_err(|error| error.to_string())
}

fn build_request(cli: &Cli) -> Result<ConversionRequest, String> {
    if cli.prompt.trim().is_empty() {
        return Err("prompt must not be empty".to_string());
    }

    let mut content = vec![ContentPart::text(cli.prompt.clone())];
    for url in &cli.images {
        let content_type = guess_image_type(url)
            .ok_or_else(|| format!("cannot tell the image type of {url}"))?;
        content.push(ContentPart::image(url.clone(), content_type));
    }

    let mut request = ConversionRequest::new(cli.model.clone(), vec![Message::User { content }]);
    if let Some(system) = &cli.system {
        request = request.with_system_prompt(system.clone());
    }
    Ok(request)
}

fn guess_image_type(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn format_tokens(tokens: Option<u64>) -> String {
    tokens.map_or_else(|| "-".to_string(), |tokens| tokens.to_string())
}

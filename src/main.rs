mod cli;

use seedcast::{config, source};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use futures::StreamExt;
use seedcast_av::{ExitKind, FfmpegInvoker, ToolRegistry};
use seedcast_core::{ResourceKey, Variant};
use seedcast_pipeline::{
    DownloadRequest, PipelineService, TempFileStore, TranscodeOptions, TranscodeOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

struct StreamArgs {
    input: PathBuf,
    content_id: Option<String>,
    stream_index: u32,
    variant: Variant,
    rate_kib: Option<u64>,
    output: Option<PathBuf>,
    keep_file: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "seedcast=debug,seedcast_pipeline=debug,seedcast_av=debug,seedcast_core=debug".to_string()
        } else {
            "seedcast=info,seedcast_pipeline=info,seedcast_av=info".to_string()
        }
    });

    // stdout may carry the transcoded stream, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Stream {
            input,
            content_id,
            stream_index,
            variant,
            rate_kib,
            output,
            keep_file,
        } => {
            let args = StreamArgs {
                input,
                content_id,
                stream_index,
                variant,
                rate_kib,
                output,
                keep_file,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(stream_file(args, cli.config.as_deref()))
        }
        Commands::Sweep => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(sweep(cli.config.as_deref()))
        }
        Commands::CheckTools => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("seedcast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn stream_file(args: StreamArgs, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    let declared_size = std::fs::metadata(&args.input)
        .with_context(|| format!("Cannot read input file: {:?}", args.input))?
        .len();

    let tools = ToolRegistry::discover(&config.pipeline.tools);
    let invoker = FfmpegInvoker::from_registry(&tools, config.pipeline.encode.clone())?;
    let service = PipelineService::new(config.pipeline.clone(), Arc::new(invoker))?;

    let rate = config.source.rate_bytes(args.rate_kib);
    let source = source::file_source(&args.input, config.source.chunk_bytes(), rate)
        .await
        .with_context(|| format!("Failed to open {:?}", args.input))?;

    let content_id = args.content_id.clone().unwrap_or_else(|| {
        args.input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "input".to_string())
    });
    let extension = args
        .input
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let request = DownloadRequest::new(ResourceKey::new(content_id, args.stream_index), declared_size)
        .with_extension(extension);

    tracing::info!(
        input = %args.input.display(),
        declared_size,
        variant = %args.variant,
        rate_bytes_per_sec = ?rate,
        "Streaming file through pipeline"
    );

    let result = tokio::select! {
        r = pump(&service, request, &args, source) => r,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down");
            Ok(())
        }
    };

    service.destroy().await;
    result
}

/// Run the transcode and copy its output to the destination.
async fn pump(
    service: &PipelineService,
    request: DownloadRequest,
    args: &StreamArgs,
    source: seedcast_pipeline::ByteSource,
) -> Result<()> {
    let options = TranscodeOptions {
        keep_file: args.keep_file,
    };
    let mut stream = service
        .transcode_with(request, args.variant, options, source)
        .await
        .context("Transcode did not start")?;
    let completion = stream.completion();

    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file: {:?}", path))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Transcoder output failed")?;
        out.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    out.flush().await?;
    drop(stream);

    match completion.wait().await {
        Some(outcome) => report(&outcome, total),
        None => Ok(()),
    }
}

fn report(outcome: &TranscodeOutcome, bytes_out: u64) -> Result<()> {
    let Some(process) = &outcome.process else {
        return Ok(());
    };
    tracing::info!(
        bytes_out,
        bytes_at_start = outcome.bytes_at_start,
        file_removed = outcome.file_removed,
        runtime_ms = process.runtime.as_millis() as u64,
        "Stream finished"
    );
    match process.kind {
        ExitKind::Success | ExitKind::Terminated => Ok(()),
        ref other => Err(seedcast_core::Error::Process {
            tool: "ffmpeg".to_string(),
            status: format!("{other:?}"),
        }
        .into()),
    }
}

async fn sweep(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let store = TempFileStore::new(config.pipeline.temp_dir.clone());

    println!("Sweeping {}", store.root().display());
    let report = store.sweep(config.pipeline.retention()).await;
    println!(
        "Scanned {}, removed {}, already gone {}, failed {}",
        report.scanned, report.removed, report.already_gone, report.failed
    );

    if report.failed > 0 {
        anyhow::bail!("{} entries could not be removed", report.failed);
    }
    Ok(())
}

async fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    println!("Checking external tools...\n");

    let registry = ToolRegistry::discover(&config.pipeline.tools);
    let tools = registry.check_all().await;
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable streaming.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    let p = &config.pipeline;
    println!("  Temp dir: {}", p.temp_dir.display());
    println!("  Max concurrent downloads: {}", p.max_concurrent_downloads);
    println!("  Threshold minimum: {} bytes", p.threshold_min_bytes);
    println!("  Session timeout: {}s", p.session_timeout_secs);
    println!(
        "  Sweep: every {}s, retention {}s",
        p.sweep_interval_secs, p.retention_secs
    );
    for warning in p.validate() {
        println!("  ! {}", warning);
    }

    Ok(())
}

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use lumen_core::seed::parse_seed;
use lumen_core::{
    loader_for_model, Aspect, AttentionBackend, DeviceChoice, GenerationRequest, Orchestrator,
    Settings, DEFAULT_STEPS,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate images from a text prompt")]
struct Args {
    /// Prompt text. Defaults to the prompt from the settings file.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Ignored by guidance-distilled models.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Denoising steps (1-20).
    #[arg(short, long, default_value_t = DEFAULT_STEPS)]
    steps: usize,

    #[arg(long, default_value_t = 0.0)]
    guidance_scale: f64,

    /// Aspect preset: 1:1, 16:9, 9:16, 4:3, 3:4 or custom.
    #[arg(long)]
    aspect: Option<Aspect>,

    /// Rounded to a multiple of 16.
    #[arg(long)]
    height: Option<usize>,

    /// Rounded to a multiple of 16.
    #[arg(long)]
    width: Option<usize>,

    /// Base seed. Empty, 0 or not a number picks random seeds.
    #[arg(long)]
    seed: Option<String>,

    #[arg(short = 'n', long, default_value_t = 1)]
    num_images: usize,

    /// Output file, or directory when it ends with a separator or has no extension.
    #[arg(short, long)]
    output: Option<String>,

    /// Directory for synthesized file names.
    #[arg(long)]
    outdir: Option<PathBuf>,

    /// auto, mps, cuda or cpu.
    #[arg(long, default_value = "auto")]
    device: DeviceChoice,

    /// sdpa, flash2 or flash3.
    #[arg(long, default_value = "sdpa")]
    attention_backend: AttentionBackend,

    #[arg(long)]
    compile: bool,

    /// Keep the text encoders on the CPU (cuda only).
    #[arg(long)]
    cpu_offload: bool,

    /// LoRA adapter name (see --list-loras) or path.
    #[arg(long)]
    lora: Option<String>,

    #[arg(long, default_value_t = 1.0)]
    lora_scale: f64,

    /// Model repository. Overrides the settings file.
    #[arg(long)]
    model: Option<String>,

    /// Settings file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the available LoRA adapters and exit.
    #[arg(long)]
    list_loras: bool,
}

impl Args {
    fn into_request(self, settings: &Settings) -> GenerationRequest {
        GenerationRequest {
            prompt: self
                .prompt
                .unwrap_or_else(|| settings.default_prompt.clone()),
            negative_prompt: self.negative_prompt,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            aspect: self.aspect,
            height: self.height,
            width: self.width,
            seed: self.seed.as_deref().and_then(parse_seed),
            num_images: self.num_images,
            device: self.device,
            attention_backend: self.attention_backend,
            compile: self.compile,
            cpu_offload: self.cpu_offload,
            lora: self.lora,
            lora_scale: self.lora_scale,
            output: self.output,
            outdir: self.outdir,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let list_loras = args.list_loras;
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(model) = &args.model {
        settings.model = model.clone();
    }

    let loader = loader_for_model(&settings.model)?;
    let adapters_root = settings.adapters.root.clone();
    let request = args.into_request(&settings);
    let mut orchestrator = Orchestrator::new(loader, settings);

    if list_loras {
        let names = orchestrator.adapters();
        if names.is_empty() {
            println!("no adapters under {}", adapters_root.display());
        }
        for name in names {
            println!("{name}");
        }
        return Ok(());
    }

    let summary = orchestrator.run(&request)?;

    println!("{}", summary.info());
    for notice in &summary.notices {
        println!("note: {notice}");
    }
    for outcome in &summary.outcomes {
        match &outcome.error {
            None => println!("[{}] seed {} -> {}", outcome.index, outcome.seed, outcome.path.display()),
            Some(err) => println!("[{}] seed {} failed: {err}", outcome.index, outcome.seed),
        }
    }
    info!(
        "{} of {} image(s) written",
        summary.succeeded(),
        summary.outcomes.len()
    );

    if let Some(reason) = &summary.aborted {
        anyhow::bail!(
            "stopped after {} of {} image(s): {reason}",
            summary.outcomes.len(),
            request.num_images
        );
    }
    if summary.failed() > 0 {
        anyhow::bail!("{} of {} image(s) failed", summary.failed(), summary.outcomes.len());
    }
    Ok(())
}

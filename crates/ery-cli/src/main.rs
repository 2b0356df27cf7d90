//! CLI binary for validating, inspecting and running Ery stage-flow catalogs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use ery_engine::{Engine, HttpEngineClient, LocalEngineClient, LoggingMiddleware};
use ery_flow::{Catalog, ConditionCompiler, FlowConfig, FlowEngine, HandId, Severity, StageKey, Transition};
use ery_script::{Scope, ScriptValue};

#[derive(Parser)]
#[command(name = "ery", version, about = "Stage-flow engine for participant modules")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a catalog against the lint rules
    Validate {
        /// Path to the catalog .json file
        catalog: PathBuf,
    },

    /// Show modules, stages, redirects and templates of a catalog
    Info {
        /// Path to the catalog .json file
        catalog: PathBuf,
    },

    /// Print the expression a condition compiles to
    Compile {
        catalog: PathBuf,

        #[arg(short, long)]
        module: String,

        #[arg(short, long)]
        condition: String,

        /// Also evaluate the expression against variables from this JSON file
        #[arg(long)]
        vars: Option<PathBuf>,
    },

    /// Print the resolved blocks of a stage as JSON
    Blocks {
        catalog: PathBuf,

        #[arg(short, long)]
        module: String,

        #[arg(short, long)]
        stage: String,

        #[arg(short, long, default_value = "Web")]
        frontend: String,

        #[arg(short, long, default_value = "en")]
        language: String,
    },

    /// Start one hand and submit until it finishes
    Run {
        catalog: PathBuf,

        #[arg(short, long)]
        module: String,

        #[arg(short, long, default_value = "Web")]
        frontend: String,

        #[arg(short, long, default_value = "en")]
        language: String,

        /// JSON object of initial variable values
        #[arg(long)]
        vars: Option<PathBuf>,

        /// Evaluation service URL (default: ERY_ENGINE_URL, else in-process)
        #[arg(long)]
        engine_url: Option<String>,

        /// Timeout for remote evaluations in milliseconds
        #[arg(long, default_value_t = ery_engine::DEFAULT_TIMEOUT_MS)]
        engine_timeout_ms: u64,

        /// Maximum number of submits before giving up
        #[arg(long, default_value = "100")]
        max_steps: u64,

        /// Directory to checkpoint to and resume from
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { catalog } => cmd_validate(&catalog)?,
        Commands::Info { catalog } => cmd_info(&catalog)?,
        Commands::Compile {
            catalog,
            module,
            condition,
            vars,
        } => cmd_compile(&catalog, &module, &condition, vars.as_deref())?,
        Commands::Blocks {
            catalog,
            module,
            stage,
            frontend,
            language,
        } => cmd_blocks(&catalog, &StageKey::new(module, stage), &frontend, &language)?,
        Commands::Run {
            catalog,
            module,
            frontend,
            language,
            vars,
            engine_url,
            engine_timeout_ms,
            max_steps,
            checkpoint,
        } => {
            let engine = build_engine(engine_url, engine_timeout_ms, cli.verbose)?;
            let options = RunOptions {
                module,
                frontend,
                language,
                vars,
                max_steps,
                checkpoint,
            };
            cmd_run(&catalog, engine, options).await?;
        }
    }

    Ok(())
}

fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    let source = std::fs::read_to_string(path)?;
    Ok(Catalog::from_json(&source)?)
}

fn load_vars(path: &Path) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    let source = std::fs::read_to_string(path)?;
    match serde_json::from_str(&source)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => anyhow::bail!("variables file must hold a JSON object, found {}", other),
    }
}

fn build_engine(url: Option<String>, timeout_ms: u64, verbose: bool) -> anyhow::Result<Engine> {
    let engine = match url {
        Some(url) => {
            let client = HttpEngineClient::new(url).with_timeout(Duration::from_millis(timeout_ms));
            println!("Engine: {}", client.endpoint());
            Engine::new(client)
        }
        None if std::env::var("ERY_ENGINE_URL").is_ok() => {
            let client = HttpEngineClient::from_env()?;
            println!("Engine: {}", client.endpoint());
            Engine::new(client)
        }
        None => Engine::new(LocalEngineClient::new()),
    };
    Ok(if verbose {
        engine.with_middleware(LoggingMiddleware)
    } else {
        engine
    })
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(path)?;
    let diagnostics = ery_flow::validate(&catalog);

    if diagnostics.is_empty() {
        println!("Catalog is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        let location = diag.location.as_deref().unwrap_or("catalog");
        println!("[{}] {} ({}): {}", severity, diag.rule, location, diag.message);
        if let Some(fix) = &diag.fix {
            println!("        fix: {}", fix);
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(path)?;

    for module in catalog.modules() {
        println!("Module: {}", module.name);
        println!("Start: {}", module.start_stage);
        println!(
            "Stages: {}  Conditions: {}  Actions: {}  Variables: {}",
            module.stage_definitions.len(),
            module.conditions.len(),
            module.actions.len(),
            module.variables.len()
        );

        println!("\nStages:");
        for stage in &module.stage_definitions {
            let mut flags = vec![format!("breadcrumbs={}", stage.breadcrumb_type)];
            if stage.end_stage {
                flags.push("end".into());
            }
            if !stage.redirect_on_submit {
                flags.push("no-submit".into());
            }
            if let Some(action) = &stage.pre_action {
                flags.push(format!("pre_action={}", action));
            }
            println!("  {} [{}]", stage.name, flags.join(" "));
            for redirect in ery_flow::ordered_redirects(stage) {
                let guard = redirect
                    .condition
                    .as_deref()
                    .map(|c| format!(" if {}", c))
                    .unwrap_or_default();
                println!("    {} -> {}{}", redirect.order, redirect.next_stage_definition, guard);
            }
        }
        println!();
    }

    println!("Templates:");
    for template in catalog.templates() {
        let parent = template.parental_template.as_deref().unwrap_or("(root)");
        println!(
            "  {} frontend={} parent={} language={} blocks={}",
            template.name,
            template.frontend,
            parent,
            template.primary_language,
            template.blocks.len()
        );
    }

    Ok(())
}

fn cmd_compile(path: &Path, module: &str, condition: &str, vars: Option<&Path>) -> anyhow::Result<()> {
    let catalog = load_catalog(path)?;
    let module = catalog.module(module)?;
    let code = ConditionCompiler::new(module, FlowConfig::default().max_condition_depth).compile(condition)?;
    println!("{}", code);

    if let Some(vars) = vars {
        let mut scope: Scope = module
            .variables
            .iter()
            .map(|v| (v.name.clone(), ScriptValue::from(v.default.clone())))
            .collect();
        for (name, value) in load_vars(vars)? {
            scope.insert(name, ScriptValue::from(value));
        }
        let passed = ery_script::evaluate_bool(condition, &code, &scope)?;
        println!("=> {}", passed);
    }
    Ok(())
}

fn cmd_blocks(path: &Path, key: &StageKey, frontend: &str, language: &str) -> anyhow::Result<()> {
    let catalog = load_catalog(path)?;
    let blocks = ery_flow::get_blocks(&catalog, key, frontend, language)?;
    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}

struct RunOptions {
    module: String,
    frontend: String,
    language: String,
    vars: Option<PathBuf>,
    max_steps: u64,
    checkpoint: Option<PathBuf>,
}

async fn cmd_run(path: &Path, engine: Engine, options: RunOptions) -> anyhow::Result<()> {
    let catalog = load_catalog(path)?;
    let config = FlowConfig {
        checkpoint_dir: options.checkpoint.clone(),
        ..FlowConfig::default()
    };
    let mut flow = FlowEngine::with_config(catalog, engine, config)?;

    let resumed = if flow.restore().await? {
        flow.runtime()
            .hands()
            .find(|h| h.module == options.module && h.is_active())
            .map(|h| h.id)
    } else {
        None
    };
    let hand: HandId = match resumed {
        Some(id) => {
            println!("Resuming hand {}", id);
            id
        }
        None => {
            let overrides = match &options.vars {
                Some(vars) => load_vars(vars)?,
                None => HashMap::new(),
            };
            flow.add_hand_with_variables(&options.module, &options.frontend, &options.language, overrides)
                .await?
        }
    };

    println!("Running module: {}", options.module);
    println!("Step limit: {}", options.max_steps);
    println!("  -> {}", flow.current_stage(hand)?);

    let mut steps = 0;
    let mut stalled = false;
    while flow.hand(hand)?.is_active() && steps < options.max_steps {
        steps += 1;
        match flow.submit(hand).await? {
            Transition::Stayed => {
                println!("Stage {} does not advance on submit", flow.current_stage(hand)?);
                stalled = true;
                break;
            }
            Transition::Replayed { to, .. } => println!("  -> {} (replayed)", to),
            Transition::Redirected { to, .. } => println!("  -> {}", to),
        }
    }

    if let Some(saved) = flow.checkpoint().await? {
        println!("Checkpoint: {}", saved.display());
    }

    let hand = flow.hand(hand)?;
    println!("\nHand {} is {} after {} submit(s)", hand.id, hand.status, steps);
    let mut variables: Vec<_> = hand.context.snapshot().await.into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in variables {
        println!("  {} = {}", name, value);
    }
    for entry in hand.context.logs().await {
        println!("  log: {}", entry);
    }
    if hand.is_active() && !stalled {
        anyhow::bail!("step limit of {} reached before an end stage", options.max_steps);
    }
    Ok(())
}

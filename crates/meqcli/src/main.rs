// crates/meqcli/src/main.rs

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meqcore::{
    Cells, EvalMode, ForestDefinition, ForestEvent, MessageLevel, NodeSpec, Request, RequestId,
};
use meqruntime::{load_definition, save_definition, validate_definition, ExecOutcome, Forest};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meq")]
#[command(about = "MeqTree forest runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Eval,
    Single,
    Double,
}

impl From<Mode> for EvalMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Eval => EvalMode::Eval,
            Mode::Single => EvalMode::EvalSingle,
            Mode::Double => EvalMode::EvalDouble,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a node of a forest definition
    Run {
        /// Path to forest definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Node to execute
        #[arg(short, long)]
        node: String,

        /// Request id, as dot-separated sub-ids
        #[arg(long, default_value = "1.1.1.1")]
        rqid: String,

        /// Cells as t0,t1,nt[:f0,f1,nf]
        #[arg(long)]
        cells: Option<String>,

        #[arg(long, value_enum, default_value = "eval")]
        mode: Mode,

        /// Number of requests to issue
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Symdep stepped between repeated requests
        #[arg(long)]
        incr: Option<String>,

        /// Threads per brigade
        #[arg(long)]
        threads: Option<usize>,

        /// Poll children serially
        #[arg(long)]
        no_mt: bool,

        /// Write node results to this log file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a forest definition
    Validate {
        /// Path to forest definition JSON file
        file: PathBuf,
    },

    /// List available node classes
    Classes,

    /// Create an example forest definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "forest.json")]
        output: PathBuf,
    },
}

struct RunArgs {
    file: PathBuf,
    node: String,
    rqid: RequestId,
    cells: Option<Cells>,
    mode: EvalMode,
    repeat: usize,
    incr: Option<String>,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("MEQ_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            node,
            rqid,
            cells,
            mode,
            repeat,
            incr,
            threads,
            no_mt,
            log,
            verbose,
        } => {
            init_logging(verbose);
            let args = RunArgs {
                file,
                node,
                rqid: rqid.parse()?,
                cells: cells.as_deref().map(parse_cells).transpose()?,
                mode: mode.into(),
                repeat: repeat.max(1),
                incr,
            };
            run_forest(args, threads, no_mt, log).await?;
        }

        Commands::Validate { file } => {
            validate_forest(file)?;
        }

        Commands::Classes => {
            list_classes();
        }

        Commands::Init { output } => {
            create_example_forest(output)?;
        }
    }

    Ok(())
}

fn parse_axis(s: &str) -> Result<(f64, f64, usize)> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [start, end, num] = parts.as_slice() else {
        bail!("axis '{}' must be start,end,num", s);
    };
    Ok((start.parse()?, end.parse()?, num.parse()?))
}

fn parse_cells(s: &str) -> Result<Cells> {
    let (time, freq) = match s.split_once(':') {
        Some((t, f)) => (parse_axis(t)?, parse_axis(f)?),
        None => (parse_axis(s)?, (0.0, 1.0, 1)),
    };
    Ok(Cells::time_freq(time, freq))
}

async fn run_forest(
    args: RunArgs,
    threads: Option<usize>,
    no_mt: bool,
    log: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 Loading forest from: {}", args.file.display());

    let mut def = load_definition(&args.file)?;
    if let Some(n) = threads {
        def.settings.brigade_size = n;
    }
    if no_mt {
        def.settings.mt_enabled = false;
    }
    if let Some(path) = log {
        def.settings.log_file = Some(path);
        def.settings.log_append = false;
    }

    println!("📋 Forest: {}", def.name);
    println!("   Nodes: {}", def.nodes.len());
    println!(
        "   Threads: {}",
        if def.settings.mt_enabled {
            format!("{} per brigade", def.settings.brigade_size)
        } else {
            "serial".to_string()
        }
    );
    println!();

    let forest = Arc::new(Forest::from_definition(&def, meqnodes::standard_registry())?);
    forest.find(&args.node)?;
    tracing::debug!(session = %forest.session(), nodes = forest.num_nodes(), "forest ready");

    let mut events = forest.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ForestEvent::Message { level, node, message, .. } => {
                    let node = node.unwrap_or_else(|| "forest".to_string());
                    match level {
                        MessageLevel::Error => println!("  ❌ [{}] {}", node, message),
                        MessageLevel::Warning => println!("  ⚠️  [{}] {}", node, message),
                        MessageLevel::Info => println!("  ℹ️  [{}] {}", node, message),
                    }
                }
                ForestEvent::BreakpointHit { node, .. } => {
                    println!("  ⏸  breakpoint in {}", node);
                }
                ForestEvent::NodeResult { node, request_id, result, .. } => {
                    println!("  ✅ {} [{}] {}", node, request_id, summarize(&result));
                }
                _ => {}
            }
        }
    });

    let runner = {
        let forest = Arc::clone(&forest);
        tokio::task::spawn_blocking(move || execute_requests(&forest, args))
    };
    let outcome = tokio::select! {
        joined = runner => joined.context("execution thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            println!("🛑 Interrupted, aborting");
            forest.raise_abort_flag();
            Err(anyhow!("interrupted"))
        }
    };

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let stats = forest.scheduler_stats();
    println!();
    println!("📊 Execution Summary:");
    println!("   Errors posted: {}", forest.error_count());
    println!("   Brigades: {} (peak active {})", stats.brigades, stats.peak_active);
    outcome
}

fn execute_requests(forest: &Forest, args: RunArgs) -> Result<()> {
    let node = forest.find(&args.node)?;
    let mut rqid = args.rqid;
    for _ in 0..args.repeat {
        let mut request = Request::new(rqid.clone()).with_eval_mode(args.mode);
        if let Some(cells) = &args.cells {
            request = request.with_cells(cells.clone());
        }
        tracing::info!(node = %args.node, rqid = %rqid, "executing");
        let outcome = forest.execute(node.index(), request)?;
        print_outcome(&args.node, &rqid, &outcome);
        if outcome.is_abort() {
            bail!("execution aborted");
        }
        if let Some(symdep) = &args.incr {
            forest.incr_request_id(&mut rqid, symdep)?;
        }
    }
    let stats = node.stats();
    println!(
        "   {}: {} executions, {} evaluations, {} cache hits",
        args.node, stats.executions, stats.evaluations, stats.cache_hits
    );
    Ok(())
}

fn print_outcome(name: &str, rqid: &RequestId, outcome: &ExecOutcome) {
    println!("📤 {} [{}] code {}", name, rqid, outcome.code);
    if outcome.is_fail() {
        for fail in outcome.result.fail_records() {
            println!("   ❌ {} ({}): {}", fail.node, fail.class, fail.message);
        }
    } else {
        println!("   {}", summarize(&outcome.result));
    }
}

fn summarize(result: &meqcore::NodeResult) -> String {
    let Some(vs) = result.vellsets.first() else {
        return "empty".to_string();
    };
    let value = match &vs.value {
        None => "no value".to_string(),
        Some(v) => match v.shape() {
            None => v.as_scalar().map(|x| x.to_string()).unwrap_or_default(),
            Some(shape) => {
                let values = v.values();
                let head: Vec<String> = values.iter().take(4).map(|x| format!("{}", x)).collect();
                let more = if values.len() > 4 { ", ..." } else { "" };
                format!("{:?} [{}{}]", shape, head.join(", "), more)
            }
        },
    };
    if vs.spids.is_empty() {
        value
    } else {
        format!("{} (spids {:?}, {} perturbed sets)", value, vs.spids, vs.num_perturbed_sets())
    }
}

fn validate_forest(file: PathBuf) -> Result<()> {
    println!("🔍 Validating forest: {}", file.display());

    let def = load_definition(&file)?;
    let registry = meqnodes::standard_registry();
    validate_definition(&def, &registry)?;

    let children: HashSet<String> = def
        .nodes
        .iter()
        .flat_map(|n| n.children.iter().chain(&n.stepchildren))
        .map(|c| c.to_string())
        .collect();
    let roots: Vec<&str> = def
        .nodes
        .iter()
        .filter(|n| !children.contains(&n.name))
        .map(|n| n.name.as_str())
        .collect();

    println!("✅ Forest is valid:");
    println!("   Name: {}", def.name);
    println!("   Nodes: {}", def.nodes.len());
    println!("   Roots: {}", roots.join(", "));

    Ok(())
}

fn list_classes() {
    println!("📦 Available Node Classes:");
    println!();

    let registry = meqnodes::standard_registry();
    for class in registry.list_classes() {
        if let Some(metadata) = registry.metadata(&class) {
            println!("  • {} ({})", class, metadata.category);
            println!("    {}", metadata.description);
            for field in &metadata.config {
                println!("      {}: {}", field.name, field.description);
            }
        } else {
            println!("  • {}", class);
        }
    }
}

fn create_example_forest(output: PathBuf) -> Result<()> {
    let mut def = ForestDefinition::new("Example gain model");
    def.description = Some("A solvable gain times a linear source".to_string());
    def.nodes = vec![
        NodeSpec::new("meq.parm", "gain")
            .with_config("value", 2.0)
            .with_config("solvable", true),
        NodeSpec::new("meq.parm", "source")
            .with_config("coeffs", vec![1.0, 0.5])
            .with_config("coeff_shape", vec![2.0, 1.0]),
        NodeSpec::new("meq.multiply", "model").with_children(["gain", "source"]),
        NodeSpec::new("meq.constant", "offset").with_config("value", 0.1),
        NodeSpec::new("meq.add", "predict").with_children(["model", "offset"]),
    ];

    save_definition(&def, &output)?;

    println!("✨ Created example forest: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  meq run --file {} --node predict --cells 0,4,4:1e8,2e8,2 --mode single",
        output.display()
    );

    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::json;

use wm_core::{
    CommitId, EmbeddingService, EngineConfig, HashEmbedder, NodeStore,
    PrefetchCoordinator, SemanticNode, StreamingAllocator, TemporalMemory, TunnelWalker,
    render_facts, render_temporal, time::now_unix_secs,
};
use wm_store::{DB_FILE, Store, default_base_dir, load_config};

/// Weight of the edge linking consecutive facts from one ingested file.
const INGEST_CHAIN_WEIGHT: f32 = 0.6;
/// Upper bound on how long `query --output` waits for the prefetch worker.
const PREFETCH_WAIT: Duration = Duration::from_millis(1500);

#[derive(Parser)]
#[command(name = "wm", about = "Working-memory engine CLI")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a single fact to the semantic graph
    Add {
        label: String,
        value: String,

        #[arg(long, default_value_t = 0.5)]
        salience: f32,

        /// Mark the fact hypothetical, decaying this many times faster
        #[arg(long)]
        hypothetical: Option<f32>,
    },

    /// Ingest text files, one fact per non-empty line
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value_t = 0.5)]
        salience: f32,
    },

    /// Link two facts with a directed weighted edge
    Link {
        from: i64,
        to: i64,

        #[arg(long, default_value_t = 1.0)]
        weight: f32,
    },

    /// Admit facts for a query and print the context block
    Query {
        text: String,

        /// Token budget for this turn (overrides wm.toml)
        #[arg(long)]
        budget: Option<i32>,

        /// Momentum signal in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        momentum: f32,

        /// Simulated generated output, fed to the prefetch worker
        #[arg(long)]
        output: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Temporal memory operations
    #[command(subcommand)]
    Trm(TrmCommand),
}

#[derive(Subcommand)]
enum TrmCommand {
    /// Push a state onto the current branch
    Push {
        content: String,

        #[arg(long, default_value = "cli")]
        source: String,

        /// Recursion depth of the state
        #[arg(long)]
        depth: Option<u32>,
    },

    /// Show the current branch's timeline
    Log,

    /// Print live context as a [STATE] block
    Context,

    /// Apply decay and prune faded states
    Decay,

    /// Create a branch, or list branches when no name is given
    Branch {
        name: Option<String>,

        /// Branch from this commit instead of HEAD
        #[arg(long)]
        from: Option<CommitId>,
    },

    /// Switch the current branch
    Checkout { name: String },

    /// Merge another branch into the current one
    Merge { source: String },

    /// Copy one commit from another branch onto HEAD
    CherryPick { branch: String, commit: CommitId },

    /// Set the decay constant
    Lambda { value: f64 },
}

struct Workspace {
    dir: PathBuf,
    store: Store,
    config: EngineConfig,
}

fn open_workspace() -> Result<Workspace> {
    let dir = default_base_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let config = load_config(&dir).context("failed to load wm.toml")?;
    let store = Store::open(&dir.join(DB_FILE)).context("failed to open store")?;
    Ok(Workspace { dir, store, config })
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Add {
            label,
            value,
            salience,
            hypothetical,
        } => cmd_add(label, value, *salience, *hypothetical),
        Commands::Ingest { files, salience } => cmd_ingest(files, *salience),
        Commands::Link { from, to, weight } => cmd_link(*from, *to, *weight),
        Commands::Query {
            text,
            budget,
            momentum,
            output,
            json,
        } => cmd_query(&cli, text, *budget, *momentum, output.as_deref(), *json),
        Commands::Stats { json } => cmd_stats(*json),
        Commands::Trm(command) => cmd_trm(command),
    }
}

fn embed_fact(embedder: &HashEmbedder, label: &str, value: &str) -> Vec<f32> {
    // Unembeddable facts are still stored; they just score without similarity.
    embedder
        .embed(&format!("{label} {value}"))
        .unwrap_or_default()
}

fn cmd_add(label: &str, value: &str, salience: f32, hypothetical: Option<f32>) -> Result<()> {
    let ws = open_workspace()?;
    let embedding = embed_fact(&HashEmbedder::default(), label, value);
    let id = ws
        .store
        .add_node(label, value, salience, &embedding)
        .context("failed to add node")?;

    if let Some(multiplier) = hypothetical {
        let graph = ws.store.load_node_store().context("failed to load graph")?;
        if let Some(node) = graph.get(id) {
            let node: SemanticNode = node.clone().hypothetical(multiplier);
            ws.store
                .insert_node(&node)
                .context("failed to mark node hypothetical")?;
        }
    }

    println!("added node {id}");
    Ok(())
}

fn cmd_ingest(files: &[PathBuf], salience: f32) -> Result<()> {
    let ws = open_workspace()?;
    let embedder = HashEmbedder::default();
    let mut total = 0;

    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let label = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("ingested");

        let mut previous: Option<i64> = None;
        let mut count = 0;
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let embedding = embed_fact(&embedder, label, line);
            let id = ws
                .store
                .add_node(label, line, salience, &embedding)
                .with_context(|| format!("failed to store fact from {}", path.display()))?;
            if let Some(prev) = previous {
                ws.store.add_edge(prev, id, INGEST_CHAIN_WEIGHT)?;
            }
            previous = Some(id);
            count += 1;
        }
        total += count;
        println!("ingested {} → {count} facts", path.display());
    }

    let stats = ws.store.stats().context("failed to read stats")?;
    println!("done. added={total}, nodes={}", stats.nodes);
    Ok(())
}

fn cmd_link(from: i64, to: i64, weight: f32) -> Result<()> {
    let ws = open_workspace()?;
    ws.store
        .add_edge(from, to, weight)
        .with_context(|| format!("failed to link {from} → {to}"))?;
    println!("linked {from} → {to} ({weight})");
    Ok(())
}

fn cmd_query(
    cli: &Cli,
    text: &str,
    budget: Option<i32>,
    momentum: f32,
    output: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let ws = open_workspace()?;
    let mut config = ws.config.clone();
    if let Some(budget) = budget {
        config.allocator.token_budget = budget;
    }

    let embedder = Arc::new(HashEmbedder::default());
    let graph = Arc::new(RwLock::new(
        ws.store.load_node_store().context("failed to load graph")?,
    ));
    let mut alloc = StreamingAllocator::new(config.allocator.clone(), embedder.clone());

    let mut admitted = {
        let g = graph.read().map_err(|_| anyhow!("graph lock poisoned"))?;
        alloc.admit_turn(&*g, text, momentum)
    };

    let mut prefetch_stats = None;
    if let Some(output) = output {
        if momentum < config.prefetch.tunnel_min_momentum {
            tracing::debug!("momentum {momentum} below tunnel threshold, skipping prefetch");
        } else {
            let coordinator = PrefetchCoordinator::new(
                Arc::clone(&graph),
                embedder.clone(),
                Arc::new(TunnelWalker),
                config.prefetch.clone(),
            );
            coordinator.update_output(output);
            coordinator.update_momentum(momentum);
            coordinator.start().context("failed to start prefetch worker")?;

            let deadline = Instant::now() + PREFETCH_WAIT;
            while coordinator.queue_len() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            coordinator.stop();

            let g = graph.read().map_err(|_| anyhow!("graph lock poisoned"))?;
            admitted.extend(alloc.admit_prefetched(&*g, &coordinator));
            prefetch_stats = Some(coordinator.stats());
        }
    }

    let mut g = graph.write().map_err(|_| anyhow!("graph lock poisoned"))?;
    let facts = render_facts(alloc.slots(), &*g);
    let served_at = now_unix_secs();
    for node in &admitted {
        alloc.ack_served(&mut *g, node.node_id);
        g.touch(node.node_id, served_at);
    }
    ws.store
        .save_salience(g.nodes())
        .context("failed to save salience")?;

    let temporal = load_temporal(&ws)?;

    if as_json {
        let nodes: Vec<_> = admitted
            .iter()
            .map(|n| {
                json!({
                    "node_id": n.node_id,
                    "label": n.label,
                    "value": n.value,
                    "priority": n.priority,
                    "tokens": n.tokens,
                })
            })
            .collect();
        let out = json!({
            "session_id": alloc.state().session_id.to_string(),
            "budget": config.allocator.token_budget,
            "total_tokens": alloc.total_tokens(),
            "admitted": nodes,
            "prefetch": prefetch_stats.map(|s| json!({
                "walks": s.walks,
                "tunnel_jumps": s.tunnel_jumps,
                "queued": s.queued,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{facts}");
    if !temporal.is_empty() {
        println!("{}", render_temporal(&temporal));
    }

    if cli.verbose {
        eprintln!(
            "--- admitted={}, tokens={}/{} ---",
            admitted.len(),
            alloc.total_tokens(),
            config.allocator.token_budget
        );
        if let Some(s) = prefetch_stats {
            eprintln!(
                "--- prefetch: walks={}, tunnel_jumps={}, queued={} ---",
                s.walks, s.tunnel_jumps, s.queued
            );
        }
    }
    Ok(())
}

fn cmd_stats(as_json: bool) -> Result<()> {
    let ws = open_workspace()?;
    let stats = ws.store.stats().context("failed to read stats")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("nodes:      {}", stats.nodes);
    println!("active:     {}", stats.active_nodes);
    println!("edges:      {}", stats.edges);
    println!("branches:   {}", stats.branches);
    println!("trm nodes:  {}", stats.temporal_nodes);
    println!("db_size:    {:.1}MB", db_size(&ws.dir) as f64 / (1024.0 * 1024.0));
    Ok(())
}

fn db_size(dir: &Path) -> u64 {
    std::fs::metadata(dir.join(DB_FILE))
        .map(|m| m.len())
        .unwrap_or(0)
}

fn load_temporal(ws: &Workspace) -> Result<TemporalMemory> {
    let snapshot = ws
        .store
        .load_temporal()
        .context("failed to load temporal memory")?;
    Ok(match snapshot {
        Some(snapshot) => TemporalMemory::restore(snapshot, ws.config.temporal.clone()),
        None => TemporalMemory::new(ws.config.temporal.clone()),
    })
}

fn cmd_trm(command: &TrmCommand) -> Result<()> {
    let ws = open_workspace()?;
    let mut memory = load_temporal(&ws)?;

    let dirty = match command {
        TrmCommand::Push {
            content,
            source,
            depth,
        } => {
            let commit = match depth {
                Some(depth) => memory.push_recursive(content, source, *depth),
                None => memory.push_state(content, source),
            };
            match commit {
                Some(commit) => println!("{commit}"),
                None => println!("dropped (repeat or recursion guard)"),
            }
            commit.is_some()
        }
        TrmCommand::Log => {
            println!("branch: {}", memory.current_branch());
            for node in memory.log() {
                let parent = node
                    .parent_id
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {parent} {:.3} {}",
                    node.commit_id, node.activation_energy, node.content
                );
            }
            false
        }
        TrmCommand::Context => {
            println!("{}", render_temporal(&memory));
            false
        }
        TrmCommand::Decay => {
            let pruned = memory.apply_decay();
            println!("pruned {pruned}, live {}", memory.len());
            true
        }
        TrmCommand::Branch { name: None, .. } => {
            for branch in memory.branches() {
                let marker = if branch.branch_name == memory.current_branch() {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {}", branch.branch_name);
            }
            false
        }
        TrmCommand::Branch {
            name: Some(name),
            from,
        } => {
            let branch = memory.create_branch(name, *from)?;
            let base = branch
                .base_commit
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("created branch {name} at {base}");
            true
        }
        TrmCommand::Checkout { name } => {
            memory.checkout_branch(name)?;
            println!("switched to {name}");
            true
        }
        TrmCommand::Merge { source } => {
            let result = memory.cognitive_merge(source)?;
            println!("{}", result.insights);
            for conflict in &result.conflicts {
                println!("conflict: {conflict}");
            }
            true
        }
        TrmCommand::CherryPick { branch, commit } => {
            let picked = memory.cherry_pick(branch, *commit)?;
            println!("{picked}");
            true
        }
        TrmCommand::Lambda { value } => {
            if !memory.receive_lambda_update(*value) {
                anyhow::bail!("lambda must be a positive finite number");
            }
            println!("lambda {}, live {}", memory.lambda(), memory.len());
            true
        }
    };

    if dirty {
        ws.store
            .save_temporal(&memory.snapshot())
            .context("failed to save temporal memory")?;
    }
    Ok(())
}

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure};
use colored::Colorize;
use dura_merge::Lane;
use dura_repo::{EngineConfig, RepoManager, RepoOptions};
use dura_types::{Deadline, DurableId, Ttl};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, warn};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Scenario(args) => cmd_scenario(args, load_config(cli.config.as_deref())?, cli.format),
        Command::Soak(args) => cmd_soak(args, load_config(cli.config.as_deref())?, cli.format),
        Command::Config(args) => {
            let path = args.path.or(cli.config);
            cmd_config(load_config(path.as_deref())?, cli.format)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .map_err(|e| anyhow!("cannot load config {}: {e}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Prints scenario steps as they happen, or gathers them for one JSON
/// document.
struct Steps {
    format: OutputFormat,
    done: Vec<serde_json::Value>,
}

impl Steps {
    fn new(format: OutputFormat) -> Self {
        Self { format, done: Vec::new() }
    }

    fn record(&mut self, step: &str, detail: String) {
        match self.format {
            OutputFormat::Text => println!("{} {} {}", "✓".green().bold(), format!("{step:<7}").bold(), detail),
            OutputFormat::Json => self.done.push(json!({ "step": step, "detail": detail })),
        }
    }

    fn finish(self) -> anyhow::Result<()> {
        if let OutputFormat::Json = self.format {
            println!("{}", serde_json::to_string_pretty(&self.done)?);
        }
        Ok(())
    }
}

fn cmd_scenario(args: ScenarioArgs, config: EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    ensure!(args.ttl_secs > 0, "--ttl-secs must be positive for the repo to be cached");
    ensure!(
        config.registry.caching_enabled(),
        "registry.max_cache_size is 0, so closed repos are never cached"
    );
    let manager = RepoManager::in_memory(config)?;
    let registry = manager.registry();
    let id = DurableId::new();
    let ttl = Ttl::from_secs(args.ttl_secs);
    let mut steps = Steps::new(format);

    let repo = manager.create_repo(id, ttl, RepoOptions::safe())?;
    for i in 0..args.updates {
        repo.put(format!("key-{}", i % 10), i.to_string());
    }
    steps.record(
        "create",
        format!("repo {} (ttl {ttl}) with {} updates", id.short_id(), args.updates),
    );

    drop(repo);
    let deadline = registry
        .deadline(&id)
        .filter(|_| registry.is_cached(&id))
        .ok_or_else(|| anyhow!("repo {id} was not cached after its last handle dropped"))?;
    steps.record(
        "close",
        format!("cached until {deadline} ({}ms from now)", (deadline - Deadline::now()).as_millis()),
    );

    let repo = manager.open_or_create_repo(id, ttl, RepoOptions::safe())?;
    ensure!(!registry.is_cached(&id), "reopened repo {id} is still cached");
    ensure!(registry.deadline(&id).is_none(), "reopened repo {id} kept its deadline");
    let read = repo.read_all()?.len() as u64;
    ensure!(read == args.updates, "read back {read} of {} updates", args.updates);
    steps.record(
        "reopen",
        format!("left the cache, deadline cleared, {read} updates in {} layers", repo.layer_count()),
    );

    drop(repo);
    let deadline = registry
        .deadline(&id)
        .ok_or_else(|| anyhow!("repo {id} was not cached after its second close"))?;
    steps.record("close", format!("cached again until {deadline}"));

    let now = if args.wait {
        thread::sleep((deadline - Deadline::now()) + Duration::from_millis(10));
        Deadline::now()
    } else {
        deadline
    };
    let report = manager.clean(now)?;
    ensure!(report.evicted.contains(&id), "clean at {now} did not evict repo {id}");
    ensure!(!registry.is_openable(&id), "repo {id} is still openable after clean");
    steps.record(
        "expire",
        format!(
            "clean at {now} evicted {} and purged {} durable(s)",
            report.evicted.len(),
            report.purged.len()
        ),
    );
    steps.finish()
}

#[derive(Debug, Default)]
struct Churn {
    opens: usize,
    updates: usize,
    releases: usize,
    cleans: usize,
    failures: usize,
}

impl Churn {
    fn absorb(&mut self, other: Churn) {
        self.opens += other.opens;
        self.updates += other.updates;
        self.releases += other.releases;
        self.cleans += other.cleans;
        self.failures += other.failures;
    }
}

/// One worker's share of the soak: open a random repository, append a few
/// updates, sometimes release them, and drop the handle.
fn churn(manager: &RepoManager, ids: &[DurableId], iterations: usize, seed: u64) -> Churn {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut churn = Churn::default();
    for _ in 0..iterations {
        let id = ids[rng.gen_range(0..ids.len())];
        let ttl = match rng.gen_range(0..4) {
            0 => Ttl::ZERO,
            1 => Ttl::from_millis(20),
            _ => Ttl::from_secs(30),
        };
        let options = if rng.gen_bool(0.5) {
            RepoOptions::safe()
        } else {
            RepoOptions::fast()
        };
        let repo = match manager.open_or_create_repo(id, ttl, options) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(repo = %id, error = %e, "soak open failed");
                churn.failures += 1;
                continue;
            }
        };
        churn.opens += 1;
        for _ in 0..rng.gen_range(1..=8) {
            repo.put(format!("k{}", rng.gen_range(0..32)), rng.gen::<u32>().to_string());
            churn.updates += 1;
        }
        if rng.gen_bool(0.25) {
            repo.release_up_to(repo.next_seq().saturating_sub(1));
            churn.releases += 1;
        }
        drop(repo);
        if rng.gen_bool(0.1) {
            match manager.clean(Deadline::now()) {
                Ok(_) => churn.cleans += 1,
                Err(e) => {
                    warn!(error = %e, "soak clean failed");
                    churn.failures += 1;
                }
            }
        }
    }
    churn
}

fn wait_for_merges(manager: &RepoManager, limit: Duration) -> bool {
    let queues = manager.queues();
    let started = Instant::now();
    loop {
        if queues.queue(Lane::Mem).is_empty() && queues.queue(Lane::Disk).is_empty() {
            return true;
        }
        if started.elapsed() >= limit {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn cmd_soak(args: SoakArgs, config: EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    ensure!(args.threads > 0, "--threads must be positive");
    ensure!(args.repos > 0, "--repos must be positive");
    let seed = args.seed.unwrap_or_else(rand::random);
    let manager = RepoManager::in_memory(config)?;
    let ids: Vec<DurableId> = (0..args.repos).map(|_| DurableId::new()).collect();
    debug!(threads = args.threads, iterations = args.iterations, seed, "soak started");

    let iterations = args.iterations;
    let started = Instant::now();
    let mut totals = Churn::default();
    let outcomes = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.threads)
            .map(|index| {
                let (manager, ids) = (&manager, &ids);
                let seed = seed.wrapping_add(index as u64);
                scope.spawn(move || churn(manager, ids, iterations, seed))
            })
            .collect();
        workers.into_iter().map(|worker| worker.join()).collect::<Vec<_>>()
    });
    for outcome in outcomes {
        totals.absorb(outcome.map_err(|_| anyhow!("soak worker panicked"))?);
    }
    let elapsed = started.elapsed();

    let drained = wait_for_merges(&manager, Duration::from_secs(10));
    let registry = manager.registry();
    let (cached, openable) = (registry.cached_len(), registry.openable_len());
    let mut layer_files = 0;
    for id in &ids {
        layer_files += manager.files().list_files(id)?.len();
    }
    let closed = manager.close_all_unreferenced();
    let reclaimed = manager.removal_queue().reclaimed_count();

    match format {
        OutputFormat::Text => {
            println!("{} soak finished in {:.2?} (seed {})", "✓".green().bold(), elapsed, seed);
            println!("  opens:       {}", totals.opens.to_string().bold());
            println!("  updates:     {}", totals.updates);
            println!("  releases:    {}", totals.releases);
            println!("  cleans:      {}", totals.cleans);
            let failures = totals.failures.to_string();
            let failures = if totals.failures == 0 { failures.green() } else { failures.red() };
            println!("  failures:    {failures}");
            println!("  merges:      {}", if drained { "drained".green() } else { "still queued".yellow() });
            println!("  cached:      {cached}");
            println!("  openable:    {openable}");
            println!("  layer files: {layer_files}");
            println!("  reclaimed:   {reclaimed} layers");
            println!("  closed:      {closed} at teardown");
        }
        OutputFormat::Json => {
            let report = json!({
                "seed": seed,
                "elapsed_ms": elapsed.as_millis() as u64,
                "opens": totals.opens,
                "updates": totals.updates,
                "releases": totals.releases,
                "cleans": totals.cleans,
                "failures": totals.failures,
                "merges_drained": drained,
                "cached": cached,
                "openable": openable,
                "layer_files": layer_files,
                "reclaimed_layers": reclaimed,
                "closed": closed,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    ensure!(totals.failures == 0, "{} soak operations failed", totals.failures);
    Ok(())
}

fn cmd_config(config: EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    print!("{}", render_config(&config, format)?);
    Ok(())
}

fn render_config(config: &EngineConfig, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Text => config.to_toml_string()?,
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.merge.mem_delay_ms = 1;
        config.merge.disk_delay_ms = 1;
        config.removal.cleaner_interval_ms = 5;
        config
    }

    #[test]
    fn missing_path_gives_defaults() {
        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
        let err = load_config(Some(Path::new("/nonexistent/dura.toml"))).unwrap_err();
        assert!(err.to_string().contains("cannot load config"));
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dura.toml");
        let mut config = quick_config();
        config.registry.max_cache_size = 7;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(load_config(Some(path.as_path())).unwrap(), config);

        std::fs::write(&path, "registry = 3").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());
    }

    #[test]
    fn config_renders_in_both_formats() {
        let mut config = quick_config();
        config.registry.max_cache_size = 7;

        let text = render_config(&config, OutputFormat::Text).unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);

        let json = render_config(&config, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["registry"]["max_cache_size"], 7);
        assert_eq!(value["merge"]["mem_delay_ms"], 1);

        cmd_config(config, OutputFormat::Text).unwrap();
    }

    #[test]
    fn churn_opens_once_per_iteration() {
        let manager = RepoManager::in_memory(quick_config()).unwrap();
        let ids: Vec<DurableId> = (0..4).map(|_| DurableId::new()).collect();
        let first = churn(&manager, &ids, 50, 7);
        assert_eq!(first.opens, 50);
        assert_eq!(first.failures, 0);
        assert!(first.updates >= 50 && first.updates <= 400);
        assert!(wait_for_merges(&manager, Duration::from_secs(10)));
    }

    #[test]
    fn soak_runs_across_threads() {
        let args = SoakArgs {
            threads: 3,
            iterations: 40,
            repos: 5,
            seed: Some(11),
        };
        cmd_soak(args, quick_config(), OutputFormat::Json).unwrap();
    }

    #[test]
    fn scenario_expires_without_waiting() {
        let args = ScenarioArgs {
            ttl_secs: 5,
            updates: 30,
            wait: false,
        };
        cmd_scenario(args, quick_config(), OutputFormat::Json).unwrap();
    }

    #[test]
    fn scenario_waits_out_the_ttl() {
        let args = ScenarioArgs {
            ttl_secs: 1,
            updates: 10,
            wait: true,
        };
        cmd_scenario(args, quick_config(), OutputFormat::Text).unwrap();
    }

    #[test]
    fn scenario_requires_caching() {
        let mut config = quick_config();
        config.registry.max_cache_size = 0;
        let args = ScenarioArgs {
            ttl_secs: 5,
            updates: 1,
            wait: false,
        };
        assert!(cmd_scenario(args, config, OutputFormat::Text).is_err());
    }
}

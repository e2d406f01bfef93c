//! jobtree CLI - drive the admission controller against a local state file

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jobtree::api::Run;
use jobtree::controller::{BudgetController, RunController};
use jobtree::{metrics, state};

/// jobtree - admission and placement controller for a shared GPU cluster
#[derive(Parser, Debug)]
#[command(name = "jobtree", version, about, long_about = None)]
struct Cli {
    /// Path to the cluster state snapshot
    #[arg(long, env = "JOBTREE_STATE", default_value = "jobtree-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a Run manifest (JSON) and reconcile it
    Submit {
        /// Path to the Run manifest
        file: PathBuf,
    },
    /// Reconcile one run, or every run when no name is given
    Reconcile {
        /// Run name
        name: Option<String>,
        /// Run namespace
        #[arg(long, default_value = "")]
        namespace: String,
    },
    /// Activate due reservations
    Activate,
    /// Simulate a node failure and swap affected groups to spares
    NodeFail {
        /// Failed node name
        node: String,
    },
    /// List runs
    Runs,
    /// List budgets with recomputed headroom
    Budgets,
    /// List leases
    Leases,
    /// List reservations
    Reservations,
    /// Print metrics in Prometheus text format
    Metrics,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> jobtree::Result<()> {
    let cluster = state::load(&cli.state)?;

    match cli.command {
        Commands::Submit { file } => {
            let data = std::fs::read(&file)?;
            let mut run: Run = serde_json::from_slice(&data)?;
            run.default_fields();
            run.validate()?;
            let mut controller = RunController::new(cluster);
            let key = controller.state_mut().upsert_run(run);
            let (namespace, name) = match key.split_once('/') {
                Some((ns, n)) => (ns.to_string(), n.to_string()),
                None => (String::new(), key.clone()),
            };
            controller.reconcile(&namespace, &name)?;
            report_run(controller.state().runs.get(&key));
            state::save(&cli.state, controller.state())?;
        }
        Commands::Reconcile { name, namespace } => {
            let mut controller = RunController::new(cluster);
            match name {
                Some(name) => controller.reconcile(&namespace, &name)?,
                None => controller.reconcile_all()?,
            }
            state::save(&cli.state, controller.state())?;
        }
        Commands::Activate => {
            let mut controller = RunController::new(cluster);
            let now = controller.now();
            controller.activate_reservations(now)?;
            state::save(&cli.state, controller.state())?;
        }
        Commands::NodeFail { node } => {
            let mut controller = RunController::new(cluster);
            let now = controller.now();
            controller.handle_node_failure(&node, now)?;
            state::save(&cli.state, controller.state())?;
        }
        Commands::Runs => {
            println!("{:<40} {:<10} {:>6}  MESSAGE", "RUN", "PHASE", "GPUS");
            for (key, run) in &cluster.runs {
                println!(
                    "{:<40} {:<10} {:>6}  {}",
                    key, run.status.phase, run.spec.resources.total_gpus, run.status.message
                );
            }
        }
        Commands::Budgets => {
            let mut cluster = cluster;
            let controller = BudgetController::new();
            let leases = cluster.leases.clone();
            controller.reconcile_all(&mut cluster.budgets, &leases);
            println!(
                "{:<24} {:<20} {:<16} {:>8} {:>10}",
                "BUDGET", "OWNER", "ENVELOPE", "FREE", "GPU-HOURS"
            );
            for budget in &cluster.budgets {
                for headroom in &budget.status.headroom {
                    let hours = headroom
                        .gpu_hours
                        .map(|h| h.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<24} {:<20} {:<16} {:>8} {:>10}",
                        budget.metadata.name,
                        budget.spec.owner,
                        headroom.name,
                        headroom.concurrency,
                        hours
                    );
                }
            }
            state::save(&cli.state, &cluster)?;
        }
        Commands::Leases => {
            println!(
                "{:<56} {:<10} {:>5} {:<8} REASON",
                "LEASE", "ROLE", "GPUS", "CLOSED"
            );
            for lease in &cluster.leases {
                println!(
                    "{:<56} {:<10} {:>5} {:<8} {}",
                    lease.metadata.name,
                    lease.spec.slice.role,
                    lease.spec.slice.nodes.len(),
                    lease.status.closed,
                    lease.status.closure_reason
                );
            }
        }
        Commands::Reservations => {
            println!(
                "{:<40} {:<10} {:<26} REASON",
                "RESERVATION", "STATE", "EARLIEST"
            );
            for reservation in cluster.reservations.values() {
                println!(
                    "{:<40} {:<10} {:<26} {}",
                    reservation.metadata.name,
                    reservation.status.state,
                    reservation.spec.earliest_start.to_rfc3339(),
                    reservation.status.reason
                );
            }
        }
        Commands::Metrics => {
            print!("{}", metrics::render_prometheus());
        }
    }
    Ok(())
}

fn report_run(run: Option<&Run>) {
    let Some(run) = run else {
        return;
    };
    println!(
        "{}: {} - {}",
        run.metadata.name, run.status.phase, run.status.message
    );
    if let Some(reservation) = &run.status.pending_reservation {
        println!("  pending reservation: {reservation}");
    }
}

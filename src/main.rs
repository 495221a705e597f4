use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use console::style;
use std::path::PathBuf;

use cohsim::{config::Config, sim::Simulator, stats::Stats, trace};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Hierarchy configuration (YAML)
    #[arg(short, long, value_name = "CONFIG")]
    config: PathBuf,

    /// Access trace, one `<cycle> <core> <op> <hex addr>` per line
    #[arg(short, long, value_name = "TRACE")]
    trace: PathBuf,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

fn init_logging(debug: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    match debug {
        0 => {}
        1 => {
            builder.filter_module("cohsim", log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_module("cohsim", log::LevelFilter::Trace);
        }
    }
    builder.init();
}

fn print_stats(sim: &Simulator, cycles: u64) {
    println!(
        "{} after {} cycles",
        style("simulation done").green().bold(),
        style(cycles).bold()
    );
    let latency = sim.latency();
    println!(
        "{:>16}: {} accesses, {:.2} avg latency, {} max",
        "cores",
        latency.accesses,
        latency.avg(),
        latency.max
    );

    for (name, stats) in sim.stats() {
        match stats {
            Stats::Cache(stats) => {
                println!(
                    "{:>16}: {} hits, {} half misses, {} misses ({:.2}% hit rate)",
                    style(&name).cyan(),
                    stats.hits(),
                    stats.half_miss.total(),
                    stats.misses(),
                    stats.hit_rate() * 100.0
                );
                for (action, count) in stats.miss_line.iter() {
                    println!("{:>16}  {:>8} line misses for {action}", "", count);
                }
                println!(
                    "{:>16}  {} displaced, {} write backs, {} invalidations",
                    "",
                    stats.displaced_send,
                    stats.write_back,
                    stats.inv_one + stats.inv_all
                );
                if stats.try_prefetch > 0 {
                    println!(
                        "{:>16}  {} prefetches sent, {} useful, {} dropped",
                        "", stats.send_prefetch, stats.prefetch_useful, stats.prefetch_dropped
                    );
                }
            }
            Stats::Memory(stats) => {
                println!(
                    "{:>16}: {} reads, {} write backs, {:.2} avg latency",
                    style(&name).cyan(),
                    stats.reads,
                    stats.write_backs,
                    stats.avg_latency()
                );
            }
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();
    init_logging(options.debug);

    let config = Config::from_path(&options.config)
        .wrap_err_with(|| format!("failed to read config {}", options.config.display()))?;
    let mut sim = Simulator::from_config(&config)?;
    let accesses = trace::from_path(&options.trace)
        .wrap_err_with(|| format!("failed to read trace {}", options.trace.display()))?;

    let start = std::time::Instant::now();
    let cycles = sim.run_trace(&accesses)?;
    log::info!(
        "simulated {} accesses in {:?}",
        accesses.len(),
        start.elapsed()
    );

    if options.json {
        let report = serde_json::json!({
            "cycles": cycles,
            "latency": sim.latency(),
            "objects": sim.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_stats(&sim, cycles);
    }
    Ok(())
}

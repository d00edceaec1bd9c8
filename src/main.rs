use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use grabit::{Controller, EokaDriver, LoopOutcome, RunConfig};

#[derive(Parser)]
#[command(name = "grabit")]
#[command(about = "Session-gated auto-clicker for booking pages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the workflow as MCP tools over stdio
    Mcp {
        /// Config file naming the login and target pages
        config: PathBuf,
    },
    /// Run the three-step workflow interactively in the terminal
    Run {
        /// Config file naming the login and target pages
        config: PathBuf,

        /// Run in headless mode (overrides config)
        #[arg(long)]
        headless: bool,

        /// Validate config without running
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    match cli.command {
        Command::Mcp { config } => {
            let config = RunConfig::load(&config)?;
            grabit::mcp::run_server(config).await
        }
        Command::Run {
            config,
            headless,
            check,
        } => {
            let mut config = RunConfig::load(&config)?;
            if headless {
                config.browser.headless = true;
            }

            if check {
                println!("Config valid");
                println!("  Login page: {}", config.login_url);
                println!("  Target page: {}", config.target_url);
                println!("  Interval: {}s", config.interval_secs);
                println!("  Navigation timeout: {}s", config.navigation_timeout_secs);
                println!("  Scan cap: {}", config.scan_cap);
                println!("  Ambiguity: {:?}", config.ambiguity);
                return Ok(());
            }

            run(config).await
        }
    }
}

async fn run(config: RunConfig) -> anyhow::Result<()> {
    let factory = EokaDriver::factory(config.browser.clone());
    let controller = Controller::new(factory, &config);

    println!("Step 1: opening browser on {}", config.login_url);
    controller.open_login().await?;
    println!("Log in manually in the opened browser, then press Enter here.");
    read_line()?;

    println!("Step 2: scanning {}", config.target_url);
    let catalog = loop {
        let catalog = controller.scan().await?;
        if !catalog.is_empty() {
            break catalog;
        }
        println!("No clickable elements found. Press Enter to rescan.");
        read_line()?;
    };

    print!("{}", catalog.listing());
    let likely = catalog.likely_slots();
    if !likely.is_empty() {
        println!("Likely booking targets: {likely:?}");
    }

    let index = loop {
        print!("Element index to arm: ");
        std::io::stdout().flush()?;
        match read_line()?.parse::<usize>() {
            Ok(i) if catalog.get(i).is_some() => break i,
            _ => println!("Enter one of the listed indices."),
        }
    };
    let selection = controller.select(index)?;

    println!(
        "Step 3: trying \"{}\" every {}s until it appears. Ctrl-C stops.",
        selection.label, config.interval_secs
    );
    controller.enable_loop()?;

    let state = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping at the next attempt boundary...");
                controller.disable_loop();
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let state = controller.loop_state();
        if state.outcome != LoopOutcome::Pending {
            break state;
        }
        if let Some(secs) = controller.seconds_until_next_tick() {
            print!("\r  attempt {} | next try in {:>3}s ", state.attempt_count, secs);
            std::io::stdout().flush()?;
        }
    };
    controller.wait_for_loop().await;

    println!();
    let failed = match state.outcome {
        LoopOutcome::Clicked => {
            println!("✓ Clicked after {} attempt(s)", state.attempt_count);
            if let Some(shot) = state.last_screenshot {
                let path = format!("grab-{}.png", shot.taken_at.format("%Y%m%d-%H%M%S"));
                std::fs::write(&path, &shot.png)?;
                println!("  Screenshot saved to {path}");
            }
            false
        }
        LoopOutcome::Stopped => {
            println!("Stopped after {} attempt(s) without a click", state.attempt_count);
            false
        }
        LoopOutcome::Failed => {
            println!("✗ Browser session lost. Log in and start again.");
            true
        }
        LoopOutcome::Pending => unreachable!("loop finished while pending"),
    };

    controller.close().await;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn read_line() -> anyhow::Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

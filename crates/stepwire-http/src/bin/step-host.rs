//! step-host: run one HTTP step, either through a plugin process or
//! in-process, and print the result.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use stepwire::{
    CallContext, LauncherConfig, PluginLauncher, RequestEnvelope, StepInput, StepPlugin,
    init_tracing,
};
use stepwire_http::HttpStep;

enum Target {
    Plugin(PathBuf),
    InProcess,
}

struct Args {
    target: Target,
    timeout: Option<Duration>,
    config: Vec<(String, String)>,
}

fn usage() {
    eprintln!("Usage: step-host [--plugin <path> | --in-process] [--timeout <secs>] key=value...");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --plugin <path>    Plugin binary [default: http-step-plugin next to this binary]");
    eprintln!("  --in-process       Run the step in this process");
    eprintln!("  --timeout <secs>   Deadline for the call");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  step-host uri=https://example.com method=GET");
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut target = None;
    let mut timeout = None;
    let mut config = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--plugin" => {
                i += 1;
                let path = args.get(i).ok_or("--plugin requires a value")?;
                target = Some(Target::Plugin(PathBuf::from(path)));
            }
            "--in-process" => target = Some(Target::InProcess),
            "--timeout" => {
                i += 1;
                let secs: f64 = args
                    .get(i)
                    .ok_or("--timeout requires a value")?
                    .parse()
                    .map_err(|_| "--timeout must be a number of seconds".to_string())?;
                timeout = Some(
                    Duration::try_from_secs_f64(secs)
                        .map_err(|_| "--timeout must be non-negative".to_string())?,
                );
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| format!("expected key=value, got '{arg}'"))?;
                config.push((key.to_string(), value.to_string()));
            }
        }
        i += 1;
    }

    let target = match target {
        Some(t) => t,
        None => Target::Plugin(default_plugin_path()?),
    };
    Ok(Args {
        target,
        timeout,
        config,
    })
}

fn default_plugin_path() -> Result<PathBuf, String> {
    let exe = std::env::current_exe().map_err(|e| format!("cannot locate plugin: {e}"))?;
    let dir = exe
        .parent()
        .ok_or_else(|| "cannot locate plugin: executable has no parent directory".to_string())?;
    Ok(dir.join("http-step-plugin"))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let ctx = match args.timeout {
        Some(t) => CallContext::with_timeout(t),
        None => CallContext::background(),
    };
    let request = RequestEnvelope::from_input(&StepInput::new(args.config))?;

    let response = match args.target {
        Target::InProcess => HttpStep::new()?.run(&ctx, request).await?,
        Target::Plugin(path) => {
            let launcher = PluginLauncher::new(LauncherConfig::new(path));
            launcher
                .with_plugin(|client| async move { client.run(&ctx, request).await })
                .await??
        }
    };

    let output = response.decode()?;
    println!("Success: {}", output.success);
    println!("Message: {}", output.message);
    Ok(())
}

use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use clap::{Parser as ClapParser, Subcommand};
use glied::{
    Arity, Class, Proc, Runtime, RuntimeCreateInfo, RuntimeError, SenseBarrier, UnaryOpSite, Value,
    VariadicSite,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log cache misses and version bumps
    #[arg(long, global = true, help = "Raise the log level to debug")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call one site from several threads while another thread keeps
    /// redefining its target
    Stress {
        #[arg(long, default_value_t = 2)]
        callers: usize,
        #[arg(long, default_value_t = 1000)]
        redefinitions: i64,
    },
    /// Nest blocks and break out of the innermost one
    Blocks {
        #[arg(long, default_value_t = 3)]
        depth: usize,
        #[arg(long, default_value_t = 42)]
        value: i64,
    },
}

/// Failures of the driver itself, as opposed to errors raised by the runtime.
#[derive(Debug)]
enum CliError {
    Runtime(RuntimeError),
    Garbage(Value),
    CallerPanicked,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Runtime(err) => write!(f, "{}", err),
            CliError::Garbage(value) => write!(f, "caller observed garbage: {:?}", value),
            CliError::CallerPanicked => write!(f, "caller thread panicked"),
        }
    }
}

impl From<RuntimeError> for CliError {
    fn from(err: RuntimeError) -> Self {
        CliError::Runtime(err)
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let rt = Runtime::new(RuntimeCreateInfo::default());
    let result = match cli.command {
        Command::Stress {
            callers,
            redefinitions,
        } => stress(&rt, callers, redefinitions),
        Command::Blocks { depth, value } => blocks(&rt, depth, value),
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}

fn define_generation(
    rt: &Runtime,
    class: &Arc<Class>,
    generation: i64,
) -> Result<(), RuntimeError> {
    rt.define_method(class, "generation", Arity::Exact(0), move |_| {
        Ok(Value::Fixnum(generation))
    })?;
    Ok(())
}

fn stress(rt: &Runtime, callers: usize, redefinitions: i64) -> Result<(), CliError> {
    let class = rt.define_class("Target", None);
    define_generation(rt, &class, 0)?;
    let receiver = rt.allocate(&class);
    let site = Arc::new(UnaryOpSite::new(rt.intern("generation")));

    let start = Arc::new(SenseBarrier::new());
    let done = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..callers)
        .map(|_| {
            let (rt, site, receiver) = (rt.clone(), site.clone(), receiver.clone());
            let (start, done, calls) = (start.clone(), done.clone(), calls.clone());
            thread::spawn(move || -> Result<(), CliError> {
                start.wait(callers + 1);
                while !done.load(Ordering::Acquire) {
                    let value = rt.execute(|rt| site.call(rt, &receiver, []))?;
                    match value.as_fixnum() {
                        Some(n) if (0..=redefinitions).contains(&n) => {}
                        _ => return Err(CliError::Garbage(value)),
                    }
                    calls.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        })
        .collect();

    start.wait(callers + 1);
    for generation in 1..=redefinitions {
        define_generation(rt, &class, generation)?;
    }
    done.store(true, Ordering::Release);

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => return Err(CliError::CallerPanicked),
        }
    }

    let cache = site.cache();
    log::info!(
        "{} calls from {} threads over {} redefinitions",
        calls.load(Ordering::Relaxed),
        callers,
        redefinitions
    );
    println!(
        "hits: {}, misses: {}, method version: {}",
        cache.hits(),
        cache.misses(),
        rt.method_version()
    );
    Ok(())
}

// Each level calls `each_once` with the next level's block; the innermost
// block breaks.
fn nested_block(site: Arc<VariadicSite>, level: usize, depth: usize, value: i64) -> Arc<Proc> {
    Proc::new(Value::Nil, None, move |bp, _| {
        if level == depth {
            return bp.break_with(Value::Fixnum(value));
        }
        let inner = nested_block(site.clone(), level + 1, depth, value);
        let observed = site.call_with_block(bp.runtime(), &Value::Nil, &[], &inner)?;
        println!("call at level {} observed {:?}", level, observed);
        Ok(observed)
    })
}

fn blocks(rt: &Runtime, depth: usize, value: i64) -> Result<(), CliError> {
    let object = rt.core().object.clone();
    rt.define_library_method(&object, "each_once", Arity::Exact(0), |inv| {
        let yielded = inv.yield_block(&[])?;
        if yielded.jumped {
            return Ok(yielded.value);
        }
        Ok(Value::Nil)
    })?;

    let site = Arc::new(VariadicSite::new(rt.intern("each_once")));
    let outermost = nested_block(site.clone(), 1, depth.max(1), value);
    let observed = rt.execute(|rt| site.call_with_block(rt, &Value::Nil, &[], &outermost))?;
    println!("call at level 0 observed {:?}", observed);
    Ok(())
}

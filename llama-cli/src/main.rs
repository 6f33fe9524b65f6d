use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use llama_inference::{
    model_quantize, system_info, ContextParams, Ftype, LlamaContext, TokenId,
};
use log::error;

/// Define the text generation subcommand.
fn run_subcommand() -> Command {
    Command::new("run")
        .about("Generate text from a prompt")
        .arg(
            Arg::new("model")
                .help("Model checkpoint file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("prompt")
                .short('p')
                .long("prompt")
                .value_name("STRING")
                .help("Prompt to start generation with")
                .default_value("")
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("n-predict")
                .short('n')
                .long("n-predict")
                .value_name("INT")
                .help("Number of tokens to predict")
                .default_value("128")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("ctx-size")
                .short('c')
                .long("ctx-size")
                .value_name("INT")
                .help("Size of the prompt context")
                .default_value("512")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("INT")
                .help("Number of threads to use during computation")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("RNG seed; <= 0 derives one from the current time")
                .default_value("-1")
                .value_parser(clap::value_parser!(i32))
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("top-k")
                .long("top-k")
                .value_name("INT")
                .help("Top-k sampling cutoff")
                .default_value("40")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new("top-p")
                .long("top-p")
                .value_name("FLOAT")
                .help("Top-p (nucleus) sampling cutoff")
                .default_value("0.95")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("temp")
                .long("temp")
                .value_name("FLOAT")
                .help("Sampling temperature; 0 decodes greedily")
                .default_value("0.8")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("repeat-penalty")
                .long("repeat-penalty")
                .value_name("FLOAT")
                .help("Penalty applied to tokens in the repeat window")
                .default_value("1.1")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("repeat-last-n")
                .long("repeat-last-n")
                .value_name("INT")
                .help("How many recent tokens the penalty considers")
                .default_value("64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("memory-f16")
                .long("memory-f16")
                .help("Store the KV cache in f16")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-mmap")
                .long("no-mmap")
                .help("Read the checkpoint instead of memory-mapping it")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("mlock")
                .long("mlock")
                .help("Lock the mapped weights in memory")
                .action(ArgAction::SetTrue),
        )
}

/// Define the quantize subcommand.
fn quantize_subcommand() -> Command {
    Command::new("quantize")
        .about("Re-encode a checkpoint with block-quantised weights")
        .arg(
            Arg::new("input")
                .help("Source checkpoint (f32 or f16 weights)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("output")
                .help("Destination checkpoint")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::new("type")
                .help("Target weight encoding: q4_0 or q4_1")
                .default_value("q4_0")
                .index(3),
        )
}

fn run_command(matches: &ArgMatches) -> Result<()> {
    let model_path = matches.get_one::<String>("model").unwrap();
    let prompt = matches.get_one::<String>("prompt").unwrap();
    let n_predict = *matches.get_one::<usize>("n-predict").unwrap();
    let n_threads = matches.get_one::<usize>("threads").copied().unwrap_or_else(|| {
        std::thread::available_parallelism().map_or(4, |n| n.get())
    });
    let top_k = *matches.get_one::<i32>("top-k").unwrap();
    let top_p = *matches.get_one::<f32>("top-p").unwrap();
    let temp = *matches.get_one::<f32>("temp").unwrap();
    let repeat_penalty = *matches.get_one::<f32>("repeat-penalty").unwrap();
    let repeat_last_n = *matches.get_one::<usize>("repeat-last-n").unwrap();

    let params = ContextParams::builder()
        .n_ctx(*matches.get_one::<u32>("ctx-size").unwrap())
        .seed(*matches.get_one::<i32>("seed").unwrap())
        .f16_kv(matches.get_flag("memory-f16"))
        .use_mmap(!matches.get_flag("no-mmap"))
        .use_mlock(matches.get_flag("mlock"))
        .build();

    let mut ctx = LlamaContext::init(Path::new(model_path), params)
        .with_context(|| format!("failed to load model from {model_path}"))?;

    eprintln!("system_info: {}", system_info());

    let prompt_tokens = ctx.tokenize(prompt, true);
    anyhow::ensure!(!prompt_tokens.is_empty(), "please provide a prompt");
    anyhow::ensure!(
        prompt_tokens.len() < ctx.n_ctx(),
        "prompt is too long ({} tokens, context is {})",
        prompt_tokens.len(),
        ctx.n_ctx()
    );

    let mut last_n_tokens: Vec<TokenId> = Vec::new();
    let mut stdout = std::io::stdout();

    // Evaluate the whole prompt in one batch, then generate.
    ctx.eval(&prompt_tokens, 0, n_threads)?;
    last_n_tokens.extend_from_slice(&prompt_tokens);
    for &token in &prompt_tokens {
        write!(stdout, "{}", ctx.token_to_str(token))?;
    }
    stdout.flush()?;

    let mut n_past = prompt_tokens.len();
    for _ in 0..n_predict {
        if n_past >= ctx.n_ctx() {
            break;
        }

        let window_start = last_n_tokens.len().saturating_sub(repeat_last_n);
        let token = ctx.sample_top_p_top_k(
            &last_n_tokens[window_start..],
            top_k,
            top_p,
            temp,
            repeat_penalty,
        );

        if token == LlamaContext::token_eos() {
            eprintln!(" [end of text]");
            break;
        }

        write!(stdout, "{}", ctx.token_to_str(token))?;
        stdout.flush()?;

        ctx.eval(&[token], n_past, n_threads)?;
        n_past += 1;
        last_n_tokens.push(token);
    }

    println!();
    ctx.print_timings();
    ctx.log_scratch_watermarks();
    Ok(())
}

fn quantize_command(matches: &ArgMatches) -> Result<()> {
    let input = matches.get_one::<String>("input").unwrap();
    let output = matches.get_one::<String>("output").unwrap();
    let ftype = match matches.get_one::<String>("type").unwrap().as_str() {
        "q4_0" => Ftype::MostlyQ4_0,
        "q4_1" => Ftype::MostlyQ4_1,
        other => anyhow::bail!("unknown quantization type '{other}' (expected q4_0 or q4_1)"),
    };

    model_quantize(Path::new(input), Path::new(output), ftype)
        .with_context(|| format!("failed to quantize {input}"))?;
    Ok(())
}

fn execute_commands() -> Result<()> {
    // Bare message format: the engine's load report reads like a report,
    // not a log.
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let matches = Command::new("llama")
        .about("LLaMA-family CPU inference")
        .subcommand(run_subcommand())
        .subcommand(quantize_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("run", matches)) => run_command(matches),
        Some(("quantize", matches)) => quantize_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}

//! matconv-emu: cycle-level convolution accelerator emulator

use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context};
use matconv_emu::config::Config;
use matconv_emu::device::HostMemory;
use matconv_emu::emu::Engine;
use matconv_emu::host::golden;
use matconv_emu::host::{run_convolution, CommandIssuer, HostPort, Matrix, MemoryLayout};

const DEFAULT_ROWS: u16 = 1080;
const DEFAULT_COLS: u16 = 1920;
const PREVIEW_ROWS: usize = 10;
const PREVIEW_COLS: usize = 20;
const MAX_REPORTED_MISMATCHES: usize = 10;

struct Options {
    subject: String,
    output: String,
    kernel: String,
    kernel_dim: u16,
    rows: u16,
    cols: u16,
    randomize: bool,
    verify: bool,
    print: bool,
}

fn usage() -> String {
    "usage: matconv-emu <SUBJECT> <OUTPUT> <KERNEL> <KERNEL_DIM> \
     [--rows R] [--cols C] [--randomize] [--verify] [--print]\n       \
     matconv-emu --sample-config"
        .to_string()
}

/// Last Ack, per-region traffic and memory footprint.
fn print_memory_report(mem: &HostMemory) {
    if let Some(ack) = mem.region("ack") {
        println!("Ack @ 0x{:x}:", ack.base_address);
        print!("{}", mem.hexdump(ack.base_address, ack.size));
        println!();
    }

    println!("Memory regions:");
    for r in mem.regions() {
        println!(
            "  {:<8} 0x{:08x} {:>8} bytes  host w/r {}/{}  accel w/r {}/{}",
            r.name, r.base_address, r.size, r.bytes_written, r.bytes_read, r.word_writes, r.word_reads
        );
    }
    println!(
        "  total host w/r {}/{} bytes, {} pages ({} bytes) resident",
        mem.total_bytes_written(),
        mem.total_bytes_read(),
        mem.allocated_pages(),
        mem.allocated_bytes()
    );
    println!();
}

fn parse_args(args: &[String]) -> anyhow::Result<Options> {
    let mut positional = Vec::new();
    let mut rows = DEFAULT_ROWS;
    let mut cols = DEFAULT_COLS;
    let mut randomize = false;
    let mut verify = false;
    let mut print = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rows" => {
                let value = iter.next().context("--rows needs a value")?;
                rows = value.parse().with_context(|| format!("bad row count '{}'", value))?;
            }
            "--cols" => {
                let value = iter.next().context("--cols needs a value")?;
                cols = value.parse().with_context(|| format!("bad column count '{}'", value))?;
            }
            "--randomize" => randomize = true,
            "--verify" => verify = true,
            "--print" => print = true,
            other if other.starts_with('-') => bail!("unknown option '{}'\n{}", other, usage()),
            other => positional.push(other.to_string()),
        }
    }

    let [subject, output, kernel, dim] = <[String; 4]>::try_from(positional)
        .map_err(|_| anyhow::anyhow!("{}", usage()))?;
    let kernel_dim = dim
        .parse()
        .with_context(|| format!("bad kernel dimension '{}'", dim))?;

    Ok(Options {
        subject,
        output,
        kernel,
        kernel_dim,
        rows,
        cols,
        randomize,
        verify,
        print,
    })
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", usage());
        return Ok(ExitCode::SUCCESS);
    }
    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(ExitCode::SUCCESS);
    }

    let opts = parse_args(&args)?;
    let config = Config::load().accelerator();
    let (rows, cols) = (opts.rows as usize, opts.cols as usize);
    let dim = opts.kernel_dim as usize;

    let mut subject = Matrix::load(&opts.subject, rows, cols)
        .with_context(|| format!("failed to read subject '{}'", opts.subject))?;
    let mut kernel = Matrix::load(&opts.kernel, dim, dim)
        .with_context(|| format!("failed to read kernel '{}'", opts.kernel))?;
    if opts.randomize {
        let mut rng = rand::thread_rng();
        subject.randomize(&mut rng);
        kernel.randomize(&mut rng);
    }

    let layout = MemoryLayout::new(opts.rows, opts.cols);
    let mut engine = Engine::new(config)?;
    layout.allocate(engine.memory_mut())?;
    kernel.store(engine.memory_mut(), layout.kernel_addr)?;
    subject.store(engine.memory_mut(), layout.subject_addr)?;

    if opts.print {
        println!("Kernel ({}x{}):", dim, dim);
        print!("{}", kernel.preview(dim, dim));
        println!();
        println!("Subject ({}x{}):", rows, cols);
        print!("{}", subject.preview(PREVIEW_ROWS, PREVIEW_COLS));
        println!();
    }

    let mut issuer = CommandIssuer::new(config.max_wait_cycles);
    let status = run_convolution(&mut engine, &mut issuer, &layout, opts.kernel_dim)?;
    if !status.is_ok() {
        bail!("accelerator reported {}", status);
    }

    let output = Matrix::fetch(engine.memory_mut(), layout.output_addr, rows, cols)?;
    output
        .save(&opts.output)
        .with_context(|| format!("failed to write output '{}'", opts.output))?;

    if opts.print {
        println!("Output ({}x{}):", rows, cols);
        print!("{}", output.preview(PREVIEW_ROWS, PREVIEW_COLS));
        println!();
    }

    if opts.print {
        print_memory_report(engine.memory());
    }

    let stats = engine.stats();
    println!(
        "Completed in {} cycles: {} bus packets, {} core jobs, {} output words",
        stats.cycles, stats.bus_packets, stats.core_jobs, stats.words_written
    );

    if opts.verify {
        let expected = golden::convolve(subject.as_bytes(), rows, cols, kernel.as_bytes(), dim);
        let mismatches = golden::compare(&expected, output.as_bytes(), cols);
        if mismatches.is_empty() {
            println!("Verify: output matches reference");
        } else {
            println!("Verify: {} mismatching pixels", mismatches.len());
            for m in mismatches.iter().take(MAX_REPORTED_MISMATCHES) {
                println!(
                    "  ({}, {}): expected {:02x}, got {:02x}",
                    m.row, m.col, m.expected, m.actual
                );
            }
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

//! MME descriptor generator CLI
//!
//! Usage:
//!   mmedesc params.json --chip gaudi3
//!   mmedesc -f params.json --hex
//!   cat params.json | mmedesc --validate-only
//!   mmedesc params.json --repeat 4 --cache-capacity 16 -v

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};
use std::process;

use mme_descgen::{
    Activation, Chip, DescGenError, DescriptorGenerator, GeneratorConfig, LayerParams,
};

#[derive(ClapParser, Debug)]
#[command(name = "mmedesc")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Generates MME hardware descriptors from layer params")]
struct Args {
    /// Layer params JSON file (reads stdin when absent)
    #[arg(value_name = "PARAMS")]
    params_file: Option<String>,

    /// Layer params JSON file
    #[arg(short = 'f', long = "file", conflicts_with = "params_file")]
    input_file: Option<String>,

    /// Target chip (gaudi2, gaudi3)
    #[arg(short = 'c', long = "chip", default_value = "gaudi2")]
    chip: Chip,

    /// Generator config JSON file, overrides --chip and --cache-capacity
    #[arg(long = "config")]
    config_file: Option<String>,

    /// Descriptor cache capacity, 0 disables the cache
    #[arg(long = "cache-capacity", default_value = "0")]
    cache_capacity: usize,

    /// Generate this many times, exercising the cache
    #[arg(short = 'r', long = "repeat", default_value = "1")]
    repeat: usize,

    /// Only validate the params
    #[arg(long = "validate-only")]
    validate_only: bool,

    /// Output the activations as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Output a hex dump of every descriptor
    #[arg(long = "hex")]
    hex_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn fail(err: DescGenError) -> ! {
    eprintln!("{}: {}", "Error".red(), err);
    process::exit(1);
}

fn read_input(args: &Args) -> Result<String, DescGenError> {
    match args.params_file.as_ref().or(args.input_file.as_ref()) {
        Some(file) => Ok(fs::read_to_string(file)?),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn load_config(args: &Args) -> Result<GeneratorConfig, DescGenError> {
    match &args.config_file {
        Some(file) => GeneratorConfig::from_json(&fs::read_to_string(file)?),
        None => Ok(GeneratorConfig::new(
            args.chip,
            args.cache_capacity.max(1),
            args.cache_capacity > 0,
        )),
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(&args).unwrap_or_else(|e| fail(e));
    let input = read_input(&args).unwrap_or_else(|e| fail(e));
    let params = LayerParams::from_json(&input).unwrap_or_else(|e| fail(e.into()));

    let mut generator = DescriptorGenerator::from_config(&config).unwrap_or_else(|e| fail(e));

    if args.verbose {
        println!("{}", "MME Descriptor Generator".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Target".green(), config);
        println!("{}: {:?}", "Operation".green(), params.op_type);
        println!();
    }

    if args.validate_only {
        match generator.validate_params(&params) {
            Ok(()) => println!("{}", "Params are valid".green()),
            Err(e) => fail(e),
        }
        return;
    }

    for _ in 0..args.repeat.max(1) {
        if let Err(e) = generator.generate(&params) {
            fail(e);
        }
    }

    if args.json_output {
        match serde_json::to_string_pretty(generator.activations()) {
            Ok(json) => println!("{}", json),
            Err(e) => fail(e.into()),
        }
    } else if args.hex_output {
        for lines in generator.dump_descriptors() {
            for line in lines {
                println!("{}", line);
            }
        }
    } else {
        print_activations(&generator, args.verbose);
    }
}

fn print_activations(generator: &DescriptorGenerator, verbose: bool) {
    let activations = generator.activations();
    println!("{}", "Generation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    for line in generator.recipe_debug_info(verbose) {
        println!("{}", line);
    }
    println!("{}: {}", "Chip".cyan(), generator.chip());
    println!("{}: {}", "Activations".cyan(), activations.len());
    let descriptors: usize = activations.iter().map(Activation::num_descriptors).sum();
    println!("{}: {}", "Descriptors".cyan(), descriptors);
    println!("{}: {}", "Squashable ROIs".cyan(), generator.can_squash_rois());
    if let Some(cache) = generator.cache() {
        println!("{}: {}", "Cache".cyan(), cache.debug_info());
    }
    println!();

    if verbose || activations.len() <= 8 {
        println!("{}", "Activation Details".bold().yellow());
        println!("{}", "-".repeat(50));

        for (idx, activation) in activations.iter().enumerate() {
            let first = activation.desc(0);
            println!();
            println!("{} {}", "Activation".bold(), idx.to_string().bold());
            println!("  {}: {}", "Descriptors".cyan(), activation.num_descriptors());
            println!("  {}: {}", "Signals".cyan(), activation.num_signals);
            println!("  {}: {}", "Tetrises".cyan(), activation.num_tetrises);
            println!("  {}: {}", "Rollups".cyan(), activation.num_rollups);
            println!("  {}: {}", "Stores".cyan(), first.is_store_en());
            println!("  {}: {:?}", "Roles".cyan(), activation.operand_roles);
            if activation.is_mask {
                println!("  {}", "masked bgemm aux activation".yellow());
            }
            if verbose {
                println!("  {}: {:x?}", "Base addresses".cyan(), first.base_addrs());
            }
        }
    } else {
        println!("({} activations, use -v for details)", activations.len());
    }
}

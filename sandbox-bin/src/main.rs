#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate sandbox;

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use error_chain::ChainedError;

use sandbox::{ProcessBuilder, Syscall};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Clap(::clap::Error);
    }
}

struct ApplicationConfig {
    pub file: PathBuf,
    pub time_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub input_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub disallowed_syscalls: Vec<String>,
}

fn get_app_config() -> Result<ApplicationConfig> {
    let matches = clap::App::new("sandbox-bin")
        .version("0.1")
        .author("Lancern <msrlancern@126.com>")
        .about("Run a single program under the sandbox and print its verdict")
        .arg(clap::Arg::with_name("time_limit")
            .short("t")
            .long("time")
            .takes_value(true)
            .value_name("TIME_LIMIT")
            .help("specify the combined CPU/wall time limit, in milliseconds"))
        .arg(clap::Arg::with_name("memory_limit")
            .short("m")
            .long("mem")
            .takes_value(true)
            .value_name("MEMORY_LIMIT")
            .help("specify the memory limit, in bytes"))
        .arg(clap::Arg::with_name("input_file")
            .short("i")
            .long("input")
            .takes_value(true)
            .value_name("INPUT_FILE")
            .help("specify the path to the input file"))
        .arg(clap::Arg::with_name("output_file")
            .short("o")
            .long("output")
            .takes_value(true)
            .value_name("OUTPUT_FILE")
            .help("specify the path to the output file"))
        .arg(clap::Arg::with_name("disallowed_syscalls")
            .short("s")
            .long("disallow")
            .takes_value(true)
            .value_name("SYSCALL_NAMEs")
            .multiple(true)
            .help("specify the names of disallowed system calls"))
        .arg(clap::Arg::with_name("program")
            .value_name("PROGRAM")
            .takes_value(true)
            .required(true)
            .help("specify the path to the program to sandbox"))
        .get_matches();

    let mut config = ApplicationConfig {
        file: PathBuf::from_str(matches.value_of("program").unwrap()).unwrap(),
        time_limit: None,
        memory_limit: None,
        input_file: None,
        output_file: None,
        disallowed_syscalls: Vec::new(),
    };

    if let Some(time_limit) = matches.value_of("time_limit") {
        let millis = u64::from_str(time_limit)
            .chain_err(|| Error::from(format!("invalid time limit value: {}", time_limit)))?;
        config.time_limit = Some(Duration::from_millis(millis));
    }

    if let Some(mem_limit) = matches.value_of("memory_limit") {
        let bytes = u64::from_str(mem_limit)
            .chain_err(|| Error::from(format!("invalid memory limit value: {}", mem_limit)))?;
        config.memory_limit = Some(bytes);
    }

    config.input_file = matches.value_of("input_file").map(|f| PathBuf::from_str(f).unwrap());
    config.output_file = matches.value_of("output_file").map(|f| PathBuf::from_str(f).unwrap());

    if let Some(syscalls) = matches.values_of("disallowed_syscalls") {
        config.disallowed_syscalls = syscalls.map(str::to_owned).collect();
    }

    Ok(config)
}

fn do_main() -> Result<()> {
    let config = get_app_config()?;

    let mut builder = ProcessBuilder::new(&config.file);

    if let Some(time_limit) = config.time_limit {
        builder.time_limit(time_limit);
    }
    if let Some(memory_limit) = config.memory_limit {
        builder.memory_limit_bytes(memory_limit);
    }
    if let Some(input_file) = config.input_file {
        let file = File::open(&input_file).chain_err(|| Error::from("cannot open input file"))?;
        builder.redirect_stdin(file);
    }
    if let Some(output_file) = config.output_file {
        let file = File::create(&output_file).chain_err(|| Error::from("cannot open output file"))?;
        builder.redirect_stdout(file);
    }
    for name in &config.disallowed_syscalls {
        let syscall = Syscall::from_name(name)
            .map_err(|e| Error::from(format!("unknown syscall {}: {}", name, e)))?;
        builder.disallow(syscall);
    }

    let result = builder.execute();

    println!("verdict: {:?}", result.code);
    println!("user CPU time: {:.3} s", result.exec_time);
    println!("peak resident memory: {} bytes", result.exec_mem);
    if let Some(syscall) = result.syscall {
        println!("offending syscall: {}", syscall);
    }
    if let Some(sig) = result.termsig {
        println!("terminating signal: {}", sig);
    }

    Ok(())
}

fn main() -> Result<()> {
    match do_main() {
        Ok(..) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e.display_chain().to_string());
            Err(e)
        }
    }
}

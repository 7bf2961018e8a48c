use anyhow::Result;
use pipesh::Interpreter;
use pipesh::cli::Args;
use pipesh::logging::init_logging;

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    init_logging(args.log_level)?;

    let mut sh = Interpreter::default();
    let status = match args.command {
        Some(line) => sh.run_script([line.as_str()]),
        None => sh.repl(&args.prompt)?,
    };

    std::process::exit(status & 0xff)
}

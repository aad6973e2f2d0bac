use std::{path::PathBuf, process::ExitCode};

use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;

use crate::{
    frontend::{parser::Parser, sema, SourceFile, SourceFileOrigin},
    middle::{
        ir::{ast_lowering::build_module, pretty_print::print_module},
        optimization::optimize_module,
        resolve::resolve_variables,
    },
};

mod frontend;
mod index;
mod middle;

#[derive(Debug, ClapParser)]
#[command(version, about = "A compiler for the MiniC language", long_about = None)]
pub struct Args {
    /// Dump an intermediate stage to stdout instead of compiling
    #[arg(short = 'e', value_enum)]
    emit: Option<EmitFormat>,
    #[arg(short = 'O', value_enum, default_value_t = Default::default())]
    optimization_level: OptimizationLevel,

    /// The MiniC source file
    input: PathBuf,
    /// Where to write the textual IR (stdout when omitted)
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EmitFormat {
    #[value(name = "ast")]
    Ast,
    #[value(name = "ir")]
    Ir,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum OptimizationLevel {
    #[value(name = "0")]
    Zero,
    #[default]
    #[value(name = "1")]
    One,
}

fn report_error(message: impl AsRef<str>) -> ExitCode {
    eprintln!("{}: {}", "error".red().bold(), message.as_ref());

    ExitCode::FAILURE
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();

    if !args.input.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("Input path '{}' is not a file!", args.input.display()),
            )
            .exit()
    }

    let contents = match std::fs::read_to_string(&args.input) {
        Ok(contents) => contents,
        Err(error) => {
            return report_error(format!(
                "failed to read '{}': {error}",
                args.input.display()
            ));
        }
    };

    let source_file = SourceFile {
        contents,
        origin: SourceFileOrigin::File(args.input),
    };

    // Construct the AST from the source code (parse failures exit directly
    // with their own diagnostics)
    let program = Parser::parse_program(&source_file);

    if args.emit == Some(EmitFormat::Ast) {
        println!("{program:#?}");
        return ExitCode::SUCCESS;
    }

    if let Err(errors) = sema::analyze_program(&program) {
        for error in &errors {
            eprintln!(
                "{}: {} ({}:{}:{})",
                "error".red().bold(),
                error.kind,
                source_file.origin,
                source_file.line_number_for_position(error.span.start),
                source_file.column_for_position(error.span.start)
            );
        }

        return ExitCode::FAILURE;
    }

    let resolved = match resolve_variables(&program.function) {
        Ok(resolved) => resolved,
        Err(error) => return report_error(error.to_string()),
    };

    let mut module = match build_module(&program, &resolved) {
        Ok(module) => module,
        Err(error) => return report_error(error.to_string()),
    };

    if args.optimization_level > OptimizationLevel::Zero {
        if let Err(error) = optimize_module(&mut module) {
            return report_error(error.to_string());
        }
    }

    let text = print_module(&module);

    if args.emit == Some(EmitFormat::Ir) {
        print!("{text}");
        return ExitCode::SUCCESS;
    }

    match &args.output {
        Some(path) => {
            if let Err(error) = std::fs::write(path, text) {
                return report_error(format!("failed to write '{}': {error}", path.display()));
            }
        }
        None => print!("{text}"),
    }

    ExitCode::SUCCESS
}

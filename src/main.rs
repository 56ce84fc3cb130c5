use mobilize::*;

use clap::{App, Arg, SubCommand};
use image::Program;
use runtime::Invocation;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn main() {
    env_logger::init();

    let matches = App::new("mobilize")
        .version("0.1.0")
        .about("Rewrites stack-VM images into migratable ones and runs them")
        .subcommand(
            SubCommand::with_name("rewrite")
                .about("Produce a self-checkpointing copy of an image")
                .arg(
                    Arg::with_name("IMAGE")
                        .help("Image file to rewrite")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run an image, or listen for migrating collections")
                .arg(
                    Arg::with_name("listen")
                        .long("listen")
                        .value_name("PORT")
                        .help("Accept handoffs on this port instead of running an image")
                        .takes_value(true)
                        .conflicts_with_all(&["IMAGE", "TYPE", "METHOD"]),
                )
                .arg(Arg::with_name("IMAGE").help("Image file to run").index(1))
                .arg(Arg::with_name("TYPE").help("Type holding the entry method").index(2))
                .arg(Arg::with_name("METHOD").help("Static entry method").index(3)),
        )
        .get_matches();

    let outcome = match matches.subcommand() {
        ("rewrite", Some(sub)) => rewrite(Path::new(sub.value_of("IMAGE").unwrap())),
        ("run", Some(sub)) => match sub.value_of("listen") {
            Some(port) => listen(port),
            None => run(sub.value_of("IMAGE"), sub.value_of("TYPE"), sub.value_of("METHOD")),
        },
        _ => Err("expected a subcommand: rewrite or run (see --help)".to_owned()),
    };

    if let Err(message) = outcome {
        eprintln!("error: {}", message);
        std::process::exit(1);
    }
}

fn rewrite(input: &Path) -> Result<(), String> {
    let program = Program::load_from_path(input).map_err(|e| e.to_string())?;
    let rewritten = translate::Rewriter::rewrite(&program).map_err(|e| e.to_string())?;

    let name = input
        .file_name()
        .ok_or_else(|| format!("{} has no file name", input.display()))?;
    let mut output = PathBuf::from(input);
    output.set_file_name(format!("m_{}", name.to_string_lossy()));
    log::info!("writing rewritten image to '{}'", output.display());
    rewritten.save_to_path(&output).map_err(|e| e.to_string())?;
    Ok(())
}

fn run(image: Option<&str>, ty: Option<&str>, method: Option<&str>) -> Result<(), String> {
    let image = image.ok_or("an image file is required (or --listen)")?;
    let program = Program::load_from_path(Path::new(image)).map_err(|e| e.to_string())?;

    // Explicit TYPE/METHOD override the image's recorded entry point
    let entry = match (ty, method) {
        (Some(ty), Some(method)) => {
            let tid = program
                .type_by_name(ty)
                .ok_or_else(|| format!("no type named '{}'", ty))?;
            program
                .method_by_name(tid, method)
                .ok_or_else(|| format!("no method named '{}' on '{}'", method, ty))?
        }
        (None, None) => program
            .entry
            .ok_or("image has no entry point; pass TYPE and METHOD")?,
        _ => return Err("TYPE and METHOD must be given together".to_owned()),
    };

    let served = host::run_standalone(
        Arc::new(program),
        Invocation { method: entry, receiver: None, args: vec![] },
    )
    .map_err(|e| e.to_string())?;
    match served.forwarded {
        Some(addr) => log::info!("collection migrated to {}", addr),
        None => log::info!("collection finished ({} contexts)", served.finished),
    }
    Ok(())
}

fn listen(port: &str) -> Result<(), String> {
    let port: u16 = port.parse().map_err(|_| format!("bad port '{}'", port))?;
    host::listen(port).map_err(|e| e.to_string())?;
    Ok(())
}

use crate::errors::unwrap_or_exit;
use crate::modules::resolve_import;
use crate::modules::ImportMap;
use crate::runtime::JsRuntime;
use crate::runtime::JsRuntimeOptions;
use clap::ArgAction;
use clap::Parser;
use clap::ValueHint;
use std::fs;
use std::path::PathBuf;

/// A secure runtime for JavaScript and TypeScript, embedding V8 directly.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(help = "The script that will run", required = true)]
    script: String,
    #[arg(
        help = "Reload every URL import (cache is ignored)",
        action = ArgAction::SetTrue,
        short,
        long
    )]
    reload: bool,
    #[arg(
        help = "Make the Math.random() method predictable",
        long = "seed",
        value_name = "NUMBER"
    )]
    seed: Option<i64>,
    #[arg(
        help = "Load import map from local file",
        long = "import-map",
        value_name = "FILE",
        value_hint = ValueHint::FilePath
    )]
    import_map: Option<PathBuf>,
}

fn load_import_map(filename: Option<&PathBuf>) -> Option<ImportMap> {
    filename.map(|file| {
        let contents = fs::read_to_string(file).map_err(anyhow::Error::from);
        let contents = unwrap_or_exit(contents);
        unwrap_or_exit(ImportMap::parse_from_json(&contents))
    })
}

/// Parses CLI arguments and runs the requested script to completion.
pub fn process_cli_arguments() {
    let cli = Cli::parse();
    let import_map = load_import_map(cli.import_map.as_ref());

    // Resolving the raw argument against `None` first lets `vale main.js`
    // and `vale ./main.js` behave the same; falling back to `./<script>`
    // covers the common case of a forgotten relative-path prefix.
    let filename = unwrap_or_exit(
        resolve_import(None, &cli.script, import_map.clone())
            .or_else(|_| resolve_import(None, &format!("./{}", cli.script), import_map.clone())),
    );

    let options = JsRuntimeOptions {
        seed: cli.seed,
        reload: cli.reload,
        import_map,
    };

    let mut runtime = JsRuntime::with_options(options);
    crate::signals::install(runtime.shutdown_handle());
    let mod_result = runtime.execute_module(&filename, None);

    match mod_result {
        Ok(_) => runtime.run_event_loop(),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    };
}

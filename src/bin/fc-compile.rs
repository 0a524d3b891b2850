use std::path::PathBuf;

use clap::Parser;

use fclabel::{FileContexts, Options};

/// Compile a text specfile database into its precompiled binary form
#[derive(Debug, Parser)]
#[clap(name = "fc-compile", version)]
pub struct App {
    /// the file_contexts file to compile
    input: PathBuf,

    /// where to write the result (defaults to INPUT.bin)
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// diagnose duplicate rules while loading
    #[clap(long)]
    validate: bool,
}

fn main() {
    let args = App::parse();

    let fc = FileContexts::open(Options {
        paths: vec![args.input.clone()],
        base_only: true,
        validating: args.validate,
        ..Options::default()
    })
    .expect("loading specfile");

    let output = args.output.unwrap_or_else(|| {
        let mut name = args.input.into_os_string();
        name.push(".bin");
        PathBuf::from(name)
    });

    let mut out = std::fs::File::create(&output).expect("creating output");
    fc.write_compiled(&mut out).expect("writing compiled specfile");
}

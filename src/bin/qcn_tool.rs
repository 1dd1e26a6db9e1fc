use clap::{App, AppSettings, Arg, ArgGroup, ArgMatches};

use log::Level;
use qcn::differ::{diff_files, DiffOptions};
use qcn::loader::{load_input, LoadOptions};
use qcn::printer::{print_snapshot, PrintOptions};
use qcn::qcn::{write_qcn, WriterOptions};
use qcn::schema::{Catalog, SchemaOptions};
use qcn::transform::build_snapshot;
use qcn::{master, Snapshot};
use std::io::{self, Write};
use std::path::Path;
use std::process::exit;

struct QcnTool {
    schema: String,
    verbosity: u64,
    diff_tool: String,
}

/// Tries to write a line to a given target, aborts program if fails.
macro_rules! try_writeln {
    ($($arg:tt)*) => (
        match writeln!($($arg)*) {
            Ok(_) => {},
            Err(e) => {
                eprintln!("{}", &e);
                exit(-1)
            }
        }
    );
}

impl QcnTool {
    fn from_cli_matches(matches: &ArgMatches) -> Self {
        QcnTool {
            schema: matches
                .value_of("schema")
                .expect("This is a required argument")
                .to_owned(),
            verbosity: matches.occurrences_of("verbose"),
            diff_tool: matches
                .value_of("diff-tool")
                .expect("has set default")
                .to_owned(),
        }
    }

    fn run(&self, matches: &ArgMatches) {
        self.try_to_initialize_logging();

        let catalog = match Catalog::from_path(&self.schema, &SchemaOptions::default()) {
            Ok(catalog) => catalog,
            Err(e) => {
                eprintln!("Failed to read schema {}.\n\tcaused by: {}", self.schema, &e);
                exit(-1)
            }
        };
        for e in &catalog.errors {
            eprintln!("schema: {e}");
        }

        if let Some(input) = matches.value_of("print") {
            let snapshot = self.load_or_die(input, &catalog);
            let options = PrintOptions {
                verbose: self.verbosity.min(u64::from(u8::MAX)) as u8,
            };
            let stdout = io::stdout();
            let mut out = stdout.lock();
            if let Err(e) = print_snapshot(&mut out, &snapshot, &options) {
                eprintln!("{}", &e);
                exit(-1)
            }
            self.dump_errors(&snapshot);
        } else if let Some(mut args) = matches.values_of("update") {
            let input = args.next().expect("min_values is 1");
            let snapshot = self.load_or_die(input, &catalog);
            match args.next() {
                Some(target) => {
                    let mut file = match std::fs::File::create(target) {
                        Ok(file) => file,
                        Err(e) => {
                            eprintln!("Failed to create {target}.\n\tcaused by: {}", &e);
                            exit(-1)
                        }
                    };
                    if let Err(e) = qcn::update_script::write_update_script(&mut file, &snapshot) {
                        eprintln!("{}", &e);
                        exit(-1)
                    }
                }
                None => {
                    let stdout = io::stdout();
                    let mut out = stdout.lock();
                    if let Err(e) = qcn::update_script::write_update_script(&mut out, &snapshot) {
                        eprintln!("{}", &e);
                        exit(-1)
                    }
                }
            }
            self.dump_errors(&snapshot);
        } else if let Some(mut args) = matches.values_of("compile") {
            let input = args.next().expect("number_of_values is 2");
            let output = args.next().expect("number_of_values is 2");
            if Path::new(output).extension().map(|e| e.to_string_lossy().to_lowercase())
                != Some("qcn".to_owned())
            {
                eprintln!("compile output `{output}` must have a .qcn extension");
                exit(-1)
            }
            let master = match master::load_master(input) {
                Ok(master) => master,
                Err(e) => {
                    eprintln!("Failed to load {input}.\n\tcaused by: {}", &e);
                    exit(-1)
                }
            };
            let snapshot = build_snapshot(&catalog, master, &LoadOptions::default().transform);
            if let Err(e) = write_qcn(&snapshot, output, &WriterOptions::default()) {
                eprintln!("Failed to write {output}.\n\tcaused by: {}", &e);
                exit(-1)
            }
            self.dump_errors(&snapshot);
        } else if let Some(mut args) = matches.values_of("diff") {
            let a = args.next().expect("number_of_values is 2");
            let b = args.next().expect("number_of_values is 2");
            let options = DiffOptions {
                tool: self.diff_tool.clone(),
                verbose: self.verbosity.min(u64::from(u8::MAX)) as u8,
            };
            match diff_files(a, b, &catalog, &LoadOptions::default(), &options) {
                Ok(code) => exit(code),
                Err(e) => {
                    eprintln!("{}", &e);
                    exit(-1)
                }
            }
        }
    }

    fn load_or_die(&self, input: &str, catalog: &Catalog) -> Snapshot {
        match load_input(input, catalog, &LoadOptions::default()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                eprintln!("Failed to load {input}.\n\tcaused by: {}", &e);
                exit(-1)
            }
        }
    }

    /// Per-item diagnostics come out as one stderr block at end of run and
    /// never change the exit code.
    fn dump_errors(&self, snapshot: &Snapshot) {
        let errors = snapshot.collect_errors();
        if errors.is_empty() {
            return;
        }
        let stderr = io::stderr();
        let mut err = stderr.lock();
        try_writeln!(err, "errors:");
        for e in errors {
            try_writeln!(err, "  {e}");
        }
    }

    fn try_to_initialize_logging(&self) {
        let level = match self.verbosity {
            0 => None,
            1 => Some(Level::Info),
            2 => Some(Level::Debug),
            _ => Some(Level::Trace),
        };
        if let Some(level) = level {
            match simple_logger::init_with_level(level) {
                Ok(_) => {}
                Err(e) => eprintln!("Failed to initialize logging: {}", e),
            };
        }
    }
}

fn main() {
    let matches = App::new("QCN Tool")
        .version(env!("CARGO_PKG_VERSION"))
        .setting(AppSettings::DeriveDisplayOrder)
        .about("Reads, prints, compiles and diffs Qualcomm NV calibration containers (QCN, MBN, NV XML)")
        .arg(
            Arg::with_name("schema")
                .short("-s")
                .long("--schema")
                .takes_value(true)
                .value_name("FILE")
                .required(true)
                .help("NV-definition schema XML, required for all operations."),
        )
        .arg(
            Arg::with_name("print")
                .short("-p")
                .long("--print")
                .takes_value(true)
                .value_name("FILE")
                .help("Prints the given file (QCN, XML, or MBN)."),
        )
        .arg(
            Arg::with_name("update")
                .short("-u")
                .long("--update")
                .takes_value(true)
                .min_values(1)
                .max_values(2)
                .value_names(&["FILE", "OUT.SH"])
                .help("Emits an nvimgr update script for the given file, to OUT.SH or stdout."),
        )
        .arg(
            Arg::with_name("compile")
                .short("-c")
                .long("--compile")
                .takes_value(true)
                .number_of_values(2)
                .value_names(&["XML", "OUT.QCN"])
                .help("Compiles a master XML into a QCN; the output extension must be .qcn."),
        )
        .arg(
            Arg::with_name("diff")
                .short("-d")
                .long("--diff")
                .takes_value(true)
                .number_of_values(2)
                .value_names(&["A", "B"])
                .help("Diffs two inputs after normalisation; XML inputs are round-tripped through a scratch QCN first."),
        )
        .arg(
            Arg::with_name("diff-tool")
                .short("-t")
                .long("--diff-tool")
                .takes_value(true)
                .default_value("diff")
                .help("External diff executable used by --diff."),
        )
        .arg(
            Arg::with_name("verbose")
                .short("-v")
                .multiple(true)
                .takes_value(false)
                .help("-v separates EFS stores in printed output and logs at info; -vv debug, -vvv trace."),
        )
        .group(
            ArgGroup::with_name("command")
                .args(&["print", "update", "compile", "diff"])
                .required(true),
        )
        .get_matches();

    let app = QcnTool::from_cli_matches(&matches);
    app.run(&matches);
}

use std::collections::VecDeque;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rten_extdata::{
    save_with_external_data, verify, verify_with_loaders, AlignmentInfo, Graph, MmapLoader,
    PrepackTable, RewriteConfig,
};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Command {
    /// Save a model with large initializers in an external data file.
    Save,

    /// Check that a rewritten model matches the original.
    Verify,
}

#[derive(Debug)]
struct Args {
    command: Command,

    /// Model to load. For `verify` this is the original model.
    model: String,

    /// Path to save the model to. For `verify` this is the rewritten model.
    output: String,

    /// Name of the external data file.
    data_file: Option<String>,

    size_threshold: u64,
    alignment: AlignmentInfo,

    /// Table of pre-packed initializers to substitute when saving.
    prepack: Option<String>,

    /// Whether pre-packed initializers were substituted (`verify` only).
    prepacked: bool,

    /// Reload and verify the model after saving.
    verify: bool,

    /// Read external data via memory mapping when verifying.
    mmap: bool,

    verbose: bool,
}

impl Args {
    /// Name of the external data file, defaulting to the output file name
    /// with a `.data` extension.
    fn data_file_name(&self) -> String {
        if let Some(name) = &self.data_file {
            return name.clone();
        }
        let stem = Path::new(&self.output)
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        format!("{}.data", stem)
    }

    fn config(&self) -> RewriteConfig {
        let default = RewriteConfig::default();
        RewriteConfig {
            size_threshold: self.size_threshold,
            alignment: self.alignment,
            apply_prepacked: self.prepack.is_some() || self.prepacked,
            verbose: self.verbose || default.verbose,
        }
    }
}

fn print_help(bin_name: &str, command: Option<Command>) {
    let options = "  -t, --threshold <bytes>        Store initializers of at least this size externally [default: 1024]
  -a, --align                    Align offsets of large initializers
      --align-threshold <bytes>  Minimum size of initializers to align [default: 1048576]
      --granularity <bytes>      Alignment of offsets [default: 65536]
  -m, --mmap                     Memory-map external data when verifying
  -v, --verbose                  Enable verbose logging
  -h, --help                     Print help";

    match command {
        Some(Command::Save) => println!(
            "Save a model with large initializers in an external data file.

Usage: {bin_name} save [OPTIONS] <model> <output>

  -d, --data <file>              Name of external data file [default: <output stem>.data]
  -p, --prepack <file>           JSON table of pre-packed initializers to substitute
      --no-verify                Skip reloading and verifying the saved model
{options}
"
        ),
        Some(Command::Verify) => println!(
            "Check that a rewritten model matches the original.

Usage: {bin_name} verify [OPTIONS] <original> <rewritten>

      --prepacked                Pre-packed initializers were substituted
{options}
"
        ),
        None => println!(
            "Save models with external initializer data.

Usage: {bin_name} <COMMAND> [OPTIONS]

Commands:
  save    Save a model with large initializers in an external data file
  verify  Check that a rewritten model matches the original

Run `{bin_name} <COMMAND> --help` for command options.
"
        ),
    }
}

fn parse_args(mut parser: lexopt::Parser) -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut command = None;
    let mut values = VecDeque::new();
    let mut data_file = None;
    let mut size_threshold = RewriteConfig::DEFAULT_SIZE_THRESHOLD;
    let mut alignment = AlignmentInfo::default();
    let mut prepack = None;
    let mut prepacked = false;
    let mut verify = true;
    let mut mmap = false;
    let mut verbose = false;

    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) if command.is_none() => {
                command = match val.string()?.as_str() {
                    "save" => Some(Command::Save),
                    "verify" => Some(Command::Verify),
                    other => return Err(format!("unknown command \"{}\"", other).into()),
                };
            }
            Value(val) => values.push_back(val.string()?),
            Short('t') | Long("threshold") => size_threshold = parser.value()?.parse()?,
            Short('a') | Long("align") => alignment.align_offset = true,
            Long("align-threshold") => alignment.align_threshold = parser.value()?.parse()?,
            Long("granularity") => alignment.allocation_granularity = parser.value()?.parse()?,
            Short('d') | Long("data") if command == Some(Command::Save) => {
                data_file = Some(parser.value()?.string()?)
            }
            Short('p') | Long("prepack") if command == Some(Command::Save) => {
                prepack = Some(parser.value()?.string()?)
            }
            Long("no-verify") if command == Some(Command::Save) => verify = false,
            Long("prepacked") if command == Some(Command::Verify) => prepacked = true,
            Short('m') | Long("mmap") => mmap = true,
            Short('v') | Long("verbose") => verbose = true,
            Short('h') | Long("help") => {
                print_help(parser.bin_name().unwrap_or("rten-extdata"), command);
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    let command = command.ok_or("missing `<COMMAND>` arg")?;
    let (model_arg, output_arg) = match command {
        Command::Save => ("missing `<model>` arg", "missing `<output>` arg"),
        Command::Verify => ("missing `<original>` arg", "missing `<rewritten>` arg"),
    };
    let model = values.pop_front().ok_or(model_arg)?;
    let output = values.pop_front().ok_or(output_arg)?;
    if let Some(extra) = values.pop_front() {
        return Err(format!("unexpected argument \"{}\"", extra).into());
    }

    Ok(Args {
        command,
        model,
        output,
        data_file,
        size_threshold,
        alignment,
        prepack,
        prepacked,
        verify,
        mmap,
        verbose,
    })
}

/// Verify `rewritten` against `original`, optionally reading external data
/// via memory mapping.
fn verify_graphs(
    original: &Graph,
    rewritten: &Graph,
    config: &RewriteConfig,
    applied_prepack: bool,
    mmap: bool,
) -> Result<(), Box<dyn Error>> {
    if mmap {
        // Safety: Data files are not modified while the loaders are alive.
        let (original_loader, rewritten_loader) = unsafe {
            (
                MmapLoader::new(original.data_dir()),
                MmapLoader::new(rewritten.data_dir()),
            )
        };
        verify_with_loaders(
            original,
            rewritten,
            config,
            applied_prepack,
            &original_loader,
            &rewritten_loader,
        )?;
    } else {
        verify(original, rewritten, config, applied_prepack)?;
    }
    Ok(())
}

fn save(args: &Args) -> Result<(), Box<dyn Error>> {
    let graph = Graph::load(Path::new(&args.model))?;
    let prepacked = match &args.prepack {
        Some(path) => PrepackTable::load(Path::new(path))?,
        None => PrepackTable::new(),
    };
    let config = args.config();
    let output = PathBuf::from(&args.output);
    let data_file = args.data_file_name();

    let start = Instant::now();
    if config.verbose && !prepacked.is_empty() {
        println!("Loaded {} pre-packed tensors", prepacked.len());
    }
    let saved = save_with_external_data(&graph, &output, &data_file, &config, &prepacked)?;
    let n_external = saved
        .initializers()
        .iter()
        .filter(|init| init.is_external())
        .count();
    println!(
        "Saved {} with {} of {} initializers in {} in {:.1}ms",
        output.display(),
        n_external,
        saved.initializers().len(),
        data_file,
        start.elapsed().as_secs_f64() * 1000.0
    );

    if args.verify {
        let reloaded = Graph::load(&output)?;
        reloaded.resolve()?;
        verify_graphs(&graph, &reloaded, &config, config.apply_prepacked, args.mmap)?;
        println!("Verified {} initializers", reloaded.initializers().len());
    }

    Ok(())
}

fn verify_saved(args: &Args) -> Result<(), Box<dyn Error>> {
    let original = Graph::load(Path::new(&args.model))?;
    let rewritten = Graph::load(Path::new(&args.output))?;
    rewritten.resolve()?;
    verify_graphs(
        &original,
        &rewritten,
        &args.config(),
        args.prepacked,
        args.mmap,
    )?;
    println!("Verified {} initializers", rewritten.initializers().len());
    Ok(())
}

/// Tool for saving models with large initializers stored in an external data
/// file, and for checking the result.
///
/// ```
/// cargo run -p rten-extdata-cli --release save model.json saved.json
/// ```
///
/// Set `RTEN_EXTDATA_VERBOSE=1` to log where each initializer is stored.
fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args(lexopt::Parser::from_env())?;
    match args.command {
        Command::Save => save(&args),
        Command::Verify => verify_saved(&args),
    }
}

#[cfg(test)]
mod tests {
    use rten_extdata::AlignmentInfo;
    use rten_extdata_testing::TestCases;

    use super::{parse_args, Command};

    #[test]
    fn test_parse_args() {
        #[derive(Debug)]
        struct Case {
            args: &'static [&'static str],
            command: Command,
            data_file: &'static str,
            size_threshold: u64,
            alignment: AlignmentInfo,
            verify: bool,
            mmap: bool,
        }

        let cases = [
            Case {
                args: &["save", "model.json", "out/saved.json"],
                command: Command::Save,
                data_file: "saved.data",
                size_threshold: 1024,
                alignment: AlignmentInfo::default(),
                verify: true,
                mmap: false,
            },
            Case {
                args: &[
                    "save",
                    "-t",
                    "0",
                    "--align",
                    "--align-threshold",
                    "64",
                    "--granularity",
                    "4096",
                    "-d",
                    "weights.bin",
                    "--no-verify",
                    "model.json",
                    "saved.json",
                ],
                command: Command::Save,
                data_file: "weights.bin",
                size_threshold: 0,
                alignment: AlignmentInfo::aligned(64, 4096),
                verify: false,
                mmap: false,
            },
            Case {
                args: &[
                    "verify",
                    "--threshold",
                    "100",
                    "--mmap",
                    "model.json",
                    "saved.json",
                ],
                command: Command::Verify,
                data_file: "saved.data",
                size_threshold: 100,
                alignment: AlignmentInfo::default(),
                verify: true,
                mmap: true,
            },
        ];

        cases.test_each(|case| {
            let args = parse_args(lexopt::Parser::from_args(case.args.iter().copied())).unwrap();
            assert_eq!(args.command, case.command);
            assert_eq!(args.data_file_name(), case.data_file);
            assert_eq!(args.size_threshold, case.size_threshold);
            assert_eq!(args.alignment, case.alignment);
            assert_eq!(args.verify, case.verify);
            assert_eq!(args.mmap, case.mmap);
        })
    }

    #[test]
    fn test_parse_args_errors() {
        #[derive(Debug)]
        struct Case {
            args: &'static [&'static str],
            expected: &'static str,
        }

        let cases = [
            Case {
                args: &[],
                expected: "missing `<COMMAND>` arg",
            },
            Case {
                args: &["convert", "model.json"],
                expected: "unknown command \"convert\"",
            },
            Case {
                args: &["save", "model.json"],
                expected: "missing `<output>` arg",
            },
            Case {
                args: &["verify", "-t", "many", "a.json", "b.json"],
                expected: "cannot parse argument \"many\"",
            },
            Case {
                args: &["verify", "--no-verify", "a.json", "b.json"],
                expected: "invalid option '--no-verify'",
            },
        ];

        cases.test_each(|case| {
            let err = parse_args(lexopt::Parser::from_args(case.args.iter().copied()))
                .err()
                .unwrap();
            assert!(
                err.to_string().contains(case.expected),
                "\"{}\" does not contain \"{}\"",
                err,
                case.expected
            );
        })
    }
}

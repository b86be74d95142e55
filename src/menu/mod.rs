use argp::FromArgs;

/// Top-level command.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(description = "Differential compression for executable files.")]
pub struct Marrow {
    #[argp(option, short = 'v', global, default = "0")]
    #[argp(
        description = "Logging level (0 = Off, 1 = Error, 2 = Warn, 3 = Info, 4 = Debug, 5 = Trace)"
    )]
    pub verbose: usize,

    #[argp(subcommand)]
    pub nested: Commands,
}

/// All operations supported via the command line.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
#[non_exhaustive]
pub enum Commands {
    Gen(GenOptions),
    Apply(ApplyOptions),
    Read(ReadOptions),
    Detect(DetectOptions),
    Match(MatchOptions),
    Crc32(Crc32Options),
}

/// Command to create a patch.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "gen")]
#[argp(description = "Create a patch that transforms an old file into a new file")]
pub struct GenOptions {
    #[argp(switch)]
    #[argp(description = "Treat inputs as raw data, without executable detection")]
    pub raw: bool,

    #[argp(option)]
    #[argp(description = "Impose element matches, as \"#+#=#+#,#+#=#+#,...\"")]
    pub impose: Option<String>,

    #[argp(positional)]
    #[argp(description = "Old file")]
    pub old_file: String,

    #[argp(positional)]
    #[argp(description = "New file")]
    pub new_file: String,

    #[argp(positional)]
    #[argp(description = "Patch file to write")]
    pub patch_file: String,
}

/// Command to apply a patch.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "apply")]
#[argp(description = "Apply a patch to an old file, reconstructing the new file")]
pub struct ApplyOptions {
    #[argp(positional)]
    #[argp(description = "Old file")]
    pub old_file: String,

    #[argp(positional)]
    #[argp(description = "Patch file")]
    pub patch_file: String,

    #[argp(positional)]
    #[argp(description = "New file to write")]
    pub new_file: String,
}

/// Command to list the references found in an executable.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "read")]
#[argp(description = "Print stats on the references found in an executable")]
pub struct ReadOptions {
    #[argp(switch)]
    #[argp(description = "Dump every reference (location and target)")]
    pub dump: bool,

    #[argp(positional)]
    #[argp(description = "Input file to be processed")]
    pub input: String,
}

/// Command to list embedded executables.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "detect")]
#[argp(description = "Print the regions and types of all detected executables")]
pub struct DetectOptions {
    #[argp(positional)]
    #[argp(description = "Input file to be processed")]
    pub input: String,
}

/// Command to run element matching and print the result.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "match")]
#[argp(description = "Match elements between two archives and print the impose string")]
pub struct MatchOptions {
    #[argp(option)]
    #[argp(description = "Impose element matches, as \"#+#=#+#,#+#=#+#,...\"")]
    pub impose: Option<String>,

    #[argp(positional)]
    #[argp(description = "Old file")]
    pub old_file: String,

    #[argp(positional)]
    #[argp(description = "New file")]
    pub new_file: String,
}

/// Command to compute a file checksum.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "crc32")]
#[argp(description = "Compute the CRC-32 of a file")]
pub struct Crc32Options {
    #[argp(positional)]
    #[argp(description = "Input file to be processed")]
    pub input: String,
}

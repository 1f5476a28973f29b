// SPDX-License-Identifier: MPL-2.0

use vmd::interop;
use vmd::{Config, Foreground, ForegroundEstimator, Sensitivity};

use anyhow::Context;
use glob::glob;
use nalgebra::DMatrix;
use std::path::{Path, PathBuf};

// Default values for some of the program arguments.
const DEFAULT_OUT_DIR: &str = "out";

const DEFAULT_NUM_MODELS: &str = "2";
const DEFAULT_BLOCK_SIZE: &str = "4";
const DEFAULT_VAR_INIT: &str = "400";
const DEFAULT_VAR_TRIM: &str = "25";
const DEFAULT_LAMBDA: &str = "0.001";
const DEFAULT_THETA_V: &str = "2500";
const DEFAULT_AGE_TRIM: &str = "30";
const DEFAULT_THETA_S: &str = "2";
const DEFAULT_THETA_D: &str = "2";
const DEFAULT_SENSITIVITY: &str = "mixed";

/// Entry point of the program.
fn main() -> anyhow::Result<()> {
    // CLI arguments related to the model parameters.
    let model_args = vec![
        clap::Arg::with_name("num-models")
            .long("num-models")
            .value_name("K")
            .default_value(DEFAULT_NUM_MODELS)
            .help("Background models per grid cell (minimum 2)"),
        clap::Arg::with_name("block-size")
            .long("block-size")
            .value_name("B")
            .default_value(DEFAULT_BLOCK_SIZE)
            .help("Side of the square grid cells; frame dimensions must be multiples"),
        clap::Arg::with_name("var-init")
            .long("var-init")
            .value_name("x")
            .default_value(DEFAULT_VAR_INIT)
            .help("Initial model variance"),
        clap::Arg::with_name("var-trim")
            .long("var-trim")
            .value_name("x")
            .default_value(DEFAULT_VAR_TRIM)
            .help("Lower bound on model variance"),
        clap::Arg::with_name("lambda")
            .long("lambda")
            .value_name("x")
            .default_value(DEFAULT_LAMBDA)
            .help("Age decay coefficient for high-variance warped cells"),
        clap::Arg::with_name("theta-v")
            .long("theta-v")
            .value_name("x")
            .default_value(DEFAULT_THETA_V)
            .help("Variance threshold starting the age decay"),
        clap::Arg::with_name("age-trim")
            .long("age-trim")
            .value_name("x")
            .default_value(DEFAULT_AGE_TRIM)
            .help("Upper bound on model age"),
        clap::Arg::with_name("theta-s")
            .long("theta-s")
            .value_name("x")
            .default_value(DEFAULT_THETA_S)
            .help("Gate for matching an observation to a model"),
        clap::Arg::with_name("theta-d")
            .long("theta-d")
            .value_name("x")
            .default_value(DEFAULT_THETA_D)
            .help("Foreground decision threshold in standard deviations"),
        clap::Arg::with_name("sensitivity")
            .long("sensitivity")
            .value_name("mode")
            .default_value(DEFAULT_SENSITIVITY)
            .help("update-first, foreground-first or mixed"),
        clap::Arg::with_name("dynamic")
            .long("dynamic")
            .help("Let the warp re-elect the apparent model per cell"),
        clap::Arg::with_name("probs")
            .long("probs")
            .help("Output anomaly scores instead of a binary mask"),
        clap::Arg::with_name("no-smooth")
            .long("no-smooth")
            .help("Skip the median + Gaussian pre-blur"),
    ];
    // CLI arguments related to input, output and the rest.
    let input_output_args = vec![
        clap::Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Multiple levels of verbosity (up to -vvv)"),
        clap::Arg::with_name("out-dir")
            .long("out-dir")
            .default_value(DEFAULT_OUT_DIR)
            .value_name("path")
            .help("Output directory to save the foreground maps"),
        clap::Arg::with_name("IMAGE or GLOB")
            .multiple(true)
            .required(true)
            .help("Paths to frames in capture order, or a glob such as \"frames/*.png\""),
    ];
    // Read all CLI arguments.
    let matches = clap::App::new("vmd")
        .version(std::env!("CARGO_PKG_VERSION"))
        .about("Moving-camera video motion detection over an image sequence")
        .args(&model_args)
        .args(&input_output_args)
        .get_matches();
    // Set log verbosity.
    let verbosity = 1 + matches.occurrences_of("verbose");
    stderrlog::new()
        .quiet(false)
        .verbosity(verbosity as usize)
        .show_level(false)
        .color(stderrlog::ColorChoice::Never)
        .init()
        .context("Failed to initialize log verbosity")?;
    // Start program.
    run(get_args(&matches)?)
}

#[derive(Debug)]
/// Type holding command line arguments.
struct Args {
    config: Config,
    out_dir: String,
    images_paths: Vec<PathBuf>,
}

/// Retrieve the program arguments from clap matches.
fn get_args(matches: &clap::ArgMatches) -> anyhow::Result<Args> {
    let sensitivity: Sensitivity = matches
        .value_of("sensitivity")
        .unwrap()
        .parse()
        .context("Failed to parse the sensitivity mode")?;
    let config = Config {
        num_models: matches.value_of("num-models").unwrap().parse()?,
        block_size: matches.value_of("block-size").unwrap().parse()?,
        var_init: matches.value_of("var-init").unwrap().parse()?,
        var_trim: matches.value_of("var-trim").unwrap().parse()?,
        lam: matches.value_of("lambda").unwrap().parse()?,
        theta_v: matches.value_of("theta-v").unwrap().parse()?,
        age_trim: matches.value_of("age-trim").unwrap().parse()?,
        theta_s: matches.value_of("theta-s").unwrap().parse()?,
        theta_d: matches.value_of("theta-d").unwrap().parse()?,
        dynamic: matches.is_present("dynamic"),
        calc_probs: matches.is_present("probs"),
        sensitivity,
        smooth: !matches.is_present("no-smooth"),
    };

    Ok(Args {
        config,
        out_dir: matches.value_of("out-dir").unwrap().to_string(),
        images_paths: absolute_file_paths(matches.values_of("IMAGE or GLOB").unwrap())?,
    })
}

/// Retrieve the absolute paths of all files matching the arguments.
fn absolute_file_paths<S: AsRef<str>, Paths: Iterator<Item = S>>(
    args: Paths,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut abs_paths = Vec::new();
    for path_glob in args {
        let mut paths = paths_from_glob(path_glob.as_ref())?;
        abs_paths.append(&mut paths);
    }
    abs_paths
        .iter()
        .map(|p| p.canonicalize().map_err(|e| e.into()))
        .collect()
}

/// Retrieve the paths of files matching the glob pattern.
fn paths_from_glob(p: &str) -> anyhow::Result<Vec<PathBuf>> {
    let paths = glob(p)?;
    Ok(paths.into_iter().filter_map(|x| x.ok()).collect())
}

/// Start actual program with command line arguments successfully parsed.
fn run(args: Args) -> anyhow::Result<()> {
    if args.images_paths.is_empty() {
        anyhow::bail!(
            "Something is wrong, I didn't find any image. Use --help to know how to use this program."
        )
    }

    let out_dir_path = PathBuf::from(&args.out_dir);
    std::fs::create_dir_all(&out_dir_path)
        .context(format!("Could not create output dir: {:?}", out_dir_path))?;

    let mut estimator = ForegroundEstimator::new(args.config)?;

    log::info!("Processing {} frames ...", args.images_paths.len());
    let pb = if log::log_enabled!(log::Level::Info) {
        indicatif::ProgressBar::new(args.images_paths.len() as u64)
    } else {
        indicatif::ProgressBar::hidden()
    };
    let now = std::time::Instant::now();
    for (id, img_path) in args.images_paths.iter().enumerate() {
        let frame = load_gray_frame(img_path)?;
        let foreground = estimator
            .process(&frame)
            .context(format!("Failed on frame {}", id))?;
        let out_path = out_dir_path.join(format!("{:05}.png", id));
        let img = match &foreground {
            Foreground::Mask(mask) => interop::image_from_matrix(mask),
            Foreground::Scores(scores) => interop::image_from_scores(scores),
        };
        img.save(&out_path)
            .context(format!("Error saving image {:?}", out_path))?;
        pb.inc(1);
    }
    pb.finish();
    let elapsed = now.elapsed().as_secs_f32();
    log::info!(
        "Processed {} frames in {:.1} s ({:.1} ms per frame)",
        args.images_paths.len(),
        elapsed,
        1000.0 * elapsed / args.images_paths.len() as f32
    );
    Ok(())
}

/// Load one frame and convert it to a gray matrix.
fn load_gray_frame(path: &Path) -> anyhow::Result<DMatrix<u8>> {
    let img = image::open(path).context(format!("Failed to open image {}", path.display()))?;
    Ok(interop::matrix_from_image(img.into_luma8()))
}

mod progress_window;

use structopt::StructOpt;

use log::warn;
use std::{path::PathBuf, time::Duration};
use neural_style::{
    image::ImageOutputFormat as ImgFmt, Error, FeatureNetwork, InitialTarget, LayerName, Session,
};

use progress_window::ProgressWindow;

fn parse_img_fmt(input: &str) -> Result<ImgFmt, String> {
    let fmt = match input {
        "png" => ImgFmt::Png,
        "jpg" => ImgFmt::Jpeg(75),
        "bmp" => ImgFmt::Bmp,
        other => {
            return Err(format!(
                "image format `{}` not one of: 'png', 'jpg', 'bmp'",
                other
            ))
        }
    };

    Ok(fmt)
}

fn parse_seconds(input: &str) -> Result<Duration, String> {
    let secs: f64 = input.parse().map_err(|e| format!("{}", e))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("`{}` is not a positive number of seconds", input));
    }

    Ok(Duration::from_secs_f64(secs))
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Repaints a content image with the style of another image",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose layout is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose textures and colors are transferred
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The image the optimization starts from, or `noise` for random pixels.
    /// Defaults to the content image
    #[structopt(long)]
    init: Option<String>,
    /// The VGG19 feature weights in safetensors format. Without them a randomly
    /// initialized network is used, which only makes sense for testing
    #[structopt(long, parse(from_os_str))]
    weights: Option<PathBuf>,
    /// The path to save the generated image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// The format to save the generated image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_img_fmt)
    )]
    out_fmt: ImgFmt,
    /// The number of optimizer steps
    #[structopt(long, default_value = "50000")]
    iterations: u32,
    /// How strongly the style losses pull on the image
    #[structopt(long, default_value = "1e6")]
    style_weight: f32,
    /// How strongly the content losses pull on the image
    #[structopt(long, default_value = "100")]
    content_weight: f32,
    /// Comma separated layers compared against the content image, eg `conv_4,conv_5`
    #[structopt(long, use_delimiter = true, default_value = "conv_4,conv_5")]
    content_layers: Vec<LayerName>,
    /// Comma separated layers compared against the style image
    #[structopt(
        long,
        use_delimiter = true,
        default_value = "conv_1,conv_2,conv_3,conv_4,conv_5"
    )]
    style_layers: Vec<LayerName>,
    /// Input images are scaled so their shorter edge has this many pixels
    #[structopt(long, default_value = "512")]
    size: u32,
    /// The learning rate of the pixel optimizer
    #[structopt(long, default_value = "1e-4")]
    learning_rate: f32,
    /// The maximum number of worker threads that can be active at any one time
    /// while evaluating the network. Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// A seed for the noise initialization and the random fallback network
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Stops the optimization after this many seconds and saves the image so far
    #[structopt(long, parse(try_from_str = parse_seconds))]
    time_limit: Option<Duration>,
    /// Don't show the progress bar
    #[structopt(long)]
    no_progress: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    // Check that the extension for the path supplied by the user is one of the ones we support
    {
        match args.output_path.extension().and_then(|ext| ext.to_str()) {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    let network = match &args.weights {
        Some(path) => FeatureNetwork::vgg19_from_file(path)?,
        None => {
            warn!("no --weights given, using a randomly initialized VGG19");
            FeatureNetwork::vgg19_random(args.seed)
        }
    };

    let init_path;
    let initial_target = match args.init.as_deref() {
        None => InitialTarget::Content,
        Some("noise") => InitialTarget::Noise { seed: args.seed },
        Some(path) => {
            init_path = PathBuf::from(path);
            InitialTarget::Image((&init_path).into())
        }
    };

    let mut sb = Session::builder()
        .content(&args.content)
        .style(&args.style)
        .initial_target(initial_target)
        .network(network)
        .iterations(args.iterations)
        .style_weight(args.style_weight)
        .content_weight(args.content_weight)
        .content_layers(args.content_layers.iter().copied())
        .style_layers(args.style_layers.iter().copied())
        .image_size(args.size)
        .learning_rate(args.learning_rate);

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    if let Some(limit) = args.time_limit {
        sb = sb.time_limit(limit);
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn neural_style::GeneratorProgress>> = if !args.no_progress {
        Some(Box::new(ProgressWindow::new()))
    } else {
        None
    };

    let generated = session.run(progress)?;

    if args.output_path.to_str() == Some("-") {
        let out = std::io::stdout();
        let mut out = out.lock();
        generated.write(&mut out, args.out_fmt)?;
    } else {
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify, but that makes
        // more sense, and is probably better than detecting and emitting
        // an error
        generated.save(&args.output_path)?;
    }

    Ok(())
}

use anyhow::{anyhow, Context};
use clap::Parser;
use gst::prelude::*;
use log::{info, warn};
use std::path::PathBuf;

mod description;

use description::{parse_mode, CameraMode, Description};

#[derive(Parser, Debug)]
#[clap(about = "Run the yolo filter on the Jetson TX2 onboard camera")]
struct Args {
    /// Camera mode (1: 2592x1944@30, 2: 2592x1458@30, 3: 1280x720@120)
    #[clap(long, default_value = "1", parse(try_from_str = parse_mode))]
    mode: CameraMode,
    /// Override the width of the frames handed to yolo
    #[clap(long)]
    width: Option<u32>,
    /// Override the height of the frames handed to yolo
    #[clap(long)]
    height: Option<u32>,
    /// Also record the annotated stream to this MP4 file
    #[clap(long)]
    movie: Option<PathBuf>,
    /// Log a summary of every detection cycle
    #[clap(long)]
    verbose: bool,
    #[clap(long)]
    cfg: Option<PathBuf>,
    #[clap(long)]
    model: Option<PathBuf>,
    #[clap(long)]
    names: Option<PathBuf>,
    #[clap(long)]
    font: Option<PathBuf>,
    #[clap(long)]
    frames: Option<u32>,
    #[clap(long)]
    single_slot: bool,
    /// Print the pipeline description and exit
    #[clap(long)]
    print: bool,
}

impl Args {
    fn description(&self) -> Description {
        let mut desc = Description::new(self.mode)
            .output(self.width, self.height)
            .movie(self.movie.as_deref())
            .property("silent", !self.verbose)
            .path_property("cfg", self.cfg.as_deref())
            .path_property("model", self.model.as_deref())
            .path_property("names", self.names.as_deref())
            .path_property("font", self.font.as_deref());
        if let Some(frames) = self.frames {
            desc = desc.property("frames", frames);
        }
        if self.single_slot {
            desc = desc.property("single-slot", true);
        }
        desc
    }
}

fn run(description: &str) -> anyhow::Result<()> {
    gst::init()?;

    let pipeline = gst::parse_launch(description)
        .with_context(|| format!("failed to parse {}", description))?;
    let bus = pipeline
        .bus()
        .ok_or_else(|| anyhow!("pipeline without a bus"))?;

    let eos_target = pipeline.clone();
    ctrlc::set_handler(move || {
        info!("Stopping...");
        if !eos_target.send_event(gst::event::Eos::new()) {
            warn!("EOS was not handled, exiting");
            std::process::exit(1);
        }
    })?;

    pipeline
        .set_state(gst::State::Playing)
        .context("failed to start up pipeline")?;

    let mut result = Ok(());
    for msg in bus.iter_timed(gst::ClockTime::NONE) {
        use gst::MessageView;

        match msg.view() {
            MessageView::Eos(..) => {
                info!("End of stream");
                break;
            }
            MessageView::Error(err) => {
                result = Err(anyhow!(
                    "error from {:?}: {} ({:?})",
                    err.src().map(|s| s.path_string()),
                    err.error(),
                    err.debug()
                ));
                break;
            }
            _ => (),
        }
    }

    pipeline.set_state(gst::State::Null)?;
    result
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::init();

    let description = args.description().build();
    if args.print {
        println!("{}", description);
        return Ok(());
    }

    info!("{}", description);
    run(&description)
}

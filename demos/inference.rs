use argh::FromArgs;
use std::path::PathBuf;

use kornia_io::functional as F;
use yolov5::{DEFAULT_SIZE, ImageSource, LoadOptions, Verbosity, load_model};

#[derive(FromArgs)]
/// YOLOv5 inference application arguments
struct Args {
    /// path to the model weights
    #[argh(
        option,
        default = "PathBuf::from(\"yolov5/weights/yolov5s.safetensors\")"
    )]
    weights: PathBuf,

    /// directory with the .jpg images to run on
    #[argh(option, default = "PathBuf::from(\"yolov5/data/images\")")]
    images_dir: PathBuf,

    /// device to run on: cpu, cuda, cuda:N, mps
    #[argh(option)]
    device: Option<String>,

    /// inference size in pixels
    #[argh(option, default = "DEFAULT_SIZE")]
    size: usize,

    /// enable test time augmentation
    #[argh(switch)]
    augment: bool,

    /// log informational messages
    #[argh(switch)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_max_level(Verbosity::from_verbose(args.verbose).level_filter())
        .init();

    let rec = rerun::RecordingStreamBuilder::new("YOLOv5 Inference App").spawn()?;

    let options = LoadOptions {
        device: args.device,
        verbose: args.verbose,
        ..Default::default()
    };
    let model = load_model(&args.weights, &options)?;

    let mut paths = std::fs::read_dir(&args.images_dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "jpg"))
        .collect::<Vec<_>>();
    paths.sort();

    // perform inference on the files so the results keep their names
    let sources = paths
        .iter()
        .map(|path| ImageSource::from(path.as_path()))
        .collect::<Vec<_>>();
    let detections = model.predict(&sources, args.size, args.augment)?;
    println!("{detections}");

    // read the images as RGB8 for logging
    let images = paths
        .iter()
        .map(F::read_image_any)
        .collect::<Result<Vec<_>, _>>()?;

    for (image, result) in images.iter().zip(detections.iter()) {
        let entity = format!("images/{}", result.file);
        rec.log(
            entity.as_str(),
            &rerun::Image::from_elements(
                image.as_slice(),
                image.size().into(),
                rerun::ColorModel::RGB,
            ),
        )?;

        let mut boxes_mins = Vec::new();
        let mut boxes_sizes = Vec::new();
        let mut class_ids = Vec::new();
        let mut labels = Vec::new();
        for detection in result.boxes {
            boxes_mins.push((detection.xmin, detection.ymin));
            boxes_sizes.push((detection.width(), detection.height()));
            class_ids.push(detection.class as u16);
            let label = detections.name(detection.class).unwrap_or("unknown");
            labels.push(label.to_string());
        }

        rec.log(
            format!("{entity}/boxes").as_str(),
            &rerun::Boxes2D::from_mins_and_sizes(boxes_mins, boxes_sizes)
                .with_class_ids(class_ids)
                .with_labels(labels),
        )?;
    }

    Ok(())
}

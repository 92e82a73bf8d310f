// This file is an example of how to use the `blink_tracker` library.
// It synthesises two blinking markers drifting across the image, feeds them through
// a single pipeline and prints what the decoder makes of them.

use blink_tracker::{BlinkPipeline, Catalogue, Frame, PipelineConfig, Point2};
use tracing_subscriber::EnvFilter;

const FRAMES: usize = 36;
const FRAMERATE: f64 = 30.0;

fn bits(code: &str) -> Vec<bool> {
    code.chars().map(|c| c == '1').collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Blink Tracker - Example Runner");

    let codes = vec![bits("110100"), bits("111010")];
    let catalogue = Catalogue::new(codes.clone())?;
    let mut pipeline = BlinkPipeline::new(PipelineConfig::default(), catalogue)?;
    pipeline.update_framerate(FRAMERATE);

    // Marker 0 drifts right, marker 1 drifts down; each lights up when its code says so.
    for k in 0..FRAMES {
        let t = k as f64 / FRAMERATE;
        let mut points = Vec::new();
        if codes[0][k % codes[0].len()] {
            points.push(Point2::new(100.0 + 0.5 * k as f64, 200.0));
        }
        if codes[1][k % codes[1].len()] {
            points.push(Point2::new(400.0, 50.0 + 0.5 * k as f64));
        }
        pipeline.process_frame(&Frame::new(t, points));
    }

    for report in pipeline.results() {
        println!(
            "{} at ({:.1}, {:.1}) -> {:?} (wire {})",
            report.sequence,
            report.last.position.x,
            report.last.position.y,
            report.id,
            report.id.wire_value()
        );
    }
    Ok(())
}

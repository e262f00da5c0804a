//! Per-trial plot: onset raster above, asynchrony per beat below

use std::error::Error;
use std::io::Cursor;

use entrain_core::TrialRecord;
use image::{ImageFormat, RgbImage};
use plotters::prelude::*;

const WIDTH: u32 = 1200;
const HEIGHT: u32 = 600;

/// Render the trial plot and encode it as PNG
pub fn render_trial_plot(record: &TrialRecord, duration_ms: f64) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let mut buffer = vec![0u8; (WIDTH * HEIGHT * 3) as usize];
    draw(&mut buffer, record, duration_ms)?;

    let image = RgbImage::from_raw(WIDTH, HEIGHT, buffer).ok_or("plot buffer has the wrong size")?;
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

fn draw(buffer: &mut [u8], record: &TrialRecord, duration_ms: f64) -> Result<(), Box<dyn Error + Send + Sync>> {
    let root = BitMapBackend::with_buffer(buffer, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((2, 1));

    let x_max = duration_ms.max(1.0);

    // Raster: stimulus ticks on the upper row, taps on the lower row
    let mut raster = ChartBuilder::on(&panels[0])
        .margin(20)
        .build_cartesian_2d(0.0..x_max, 0.0..2.0)?;

    for &t in &record.stim_onsets_ms {
        raster.draw_series(std::iter::once(PathElement::new(vec![(t, 1.1), (t, 1.9)], BLUE.stroke_width(2))))?;
    }
    for &t in &record.stim_onsets_detected_ms {
        raster.draw_series(std::iter::once(PathElement::new(vec![(t, 1.1), (t, 1.5)], BLUE.mix(0.4))))?;
    }
    for &t in &record.resp_onsets_ms {
        raster.draw_series(std::iter::once(PathElement::new(vec![(t, 0.1), (t, 0.9)], RED.stroke_width(2))))?;
    }

    // Asynchrony per beat, zero line for reference
    let asynchronies: Vec<(f64, f64)> = record
        .alignment
        .iter()
        .filter_map(|a| a.asynchrony_ms.map(|d| (a.stimulus_ms, d)))
        .collect();
    let y_span = asynchronies.iter().map(|(_, d)| d.abs()).fold(50.0f64, f64::max) * 1.1;

    let mut lower = ChartBuilder::on(&panels[1])
        .margin(20)
        .build_cartesian_2d(0.0..x_max, -y_span..y_span)?;

    lower.draw_series(std::iter::once(PathElement::new(vec![(0.0, 0.0), (x_max, 0.0)], BLACK.mix(0.3))))?;
    lower.draw_series(LineSeries::new(asynchronies.iter().copied(), RED.mix(0.5)))?;
    lower.draw_series(asynchronies.iter().map(|&(x, y)| Circle::new((x, y), 4, RED.filled())))?;

    root.present()?;
    Ok(())
}

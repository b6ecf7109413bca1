use crate::block::{CHANNEL_NAMES, NUM_CHANNELS};
use crate::emitter::MergedSample;
use crate::spectral::SpectralAccumulator;
use crate::utils::DynError;
use plotters::prelude::PathElement;
use plotters::prelude::*;

const PLOT_FONT_SCALE: f64 = 1.2;

const CHANNEL_COLORS: [RGBColor; NUM_CHANNELS] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(23, 190, 207),
];

fn scaled_font_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn scaled_area_size(base: i32) -> i32 {
    ((base as f64) * PLOT_FONT_SCALE).round() as i32
}

fn finite_range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        return None;
    }
    if lo == hi {
        // flat series still needs a non-empty axis
        let pad = if lo == 0.0 { 1.0 } else { lo.abs() * 0.05 };
        return Some((lo - pad, hi + pad));
    }
    Some((lo, hi))
}

pub fn plot_multi_series_f64_x(
    x_vals: &[f64],
    series: &[(&[f64], &RGBColor, &str)],
    title: &str,
    filename: &str,
    x_label: &str,
    y_label: &str,
    y_range: Option<(f64, f64)>,
) -> Result<(), DynError> {
    if series.is_empty() {
        return Err("No series provided to plot".into());
    }
    for (data_series, _, _) in series.iter() {
        if data_series.len() != x_vals.len() {
            return Err("X-value vector length does not match data length".into());
        }
    }
    if x_vals.is_empty() {
        return Err("No data points to plot".into());
    }

    let (x_min, x_max) =
        finite_range(x_vals.iter().copied()).ok_or("Failed to determine x range")?;
    let (min_val, max_val) = match y_range {
        Some(range) => range,
        None => finite_range(series.iter().flat_map(|(d, _, _)| d.iter().copied()))
            .ok_or("Failed to determine y range")?,
    };

    let root = BitMapBackend::new(filename, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", scaled_font_size(28)).into_font())
        .margin(10)
        .x_label_area_size(scaled_area_size(40))
        .y_label_area_size(scaled_area_size(60))
        .build_cartesian_2d(x_min..x_max, min_val..max_val)?;

    chart
        .configure_mesh()
        .x_desc(x_label)
        .y_desc(y_label)
        .label_style(("sans-serif", scaled_font_size(20)).into_font())
        .axis_desc_style(("sans-serif", scaled_font_size(24)).into_font())
        .light_line_style(WHITE.mix(0.0))
        .draw()?;

    for (data_series, color, label) in series.iter() {
        chart
            .draw_series(LineSeries::new(
                x_vals.iter().zip(data_series.iter()).map(|(x, y)| (*x, *y)),
                *color,
            ))?
            .label(*label)
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 10, y)], *color));
    }

    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(&WHITE.mix(0.8))
        .label_font(("sans-serif", scaled_font_size(20)).into_font())
        .draw()?;

    root.present()?;
    Ok(())
}

pub fn plot_spectra(spectra: &SpectralAccumulator, filename: &str) -> Result<(), DynError> {
    let grid = spectra.grid();
    if grid.bins < 2 {
        return Err("need at least two frequency bins to plot a spectrum".into());
    }
    let freqs = grid.frequencies().split_off(1);
    let series: Vec<(&[f64], &RGBColor, &str)> = (0..NUM_CHANNELS)
        .map(|c| {
            (
                &spectra.channel(c).values()[1..],
                &CHANNEL_COLORS[c],
                CHANNEL_NAMES[c],
            )
        })
        .collect();
    plot_multi_series_f64_x(
        &freqs,
        &series,
        "wedge current spectra",
        filename,
        "Frequency [Hz]",
        "Magnitude",
        None,
    )
}

pub fn plot_transit_window(
    window: &[MergedSample],
    title: &str,
    filename: &str,
) -> Result<(), DynError> {
    let times: Vec<f64> = window.iter().map(|s| s.timestamp).collect();
    let traces: Vec<Vec<f64>> = (0..NUM_CHANNELS)
        .map(|c| window.iter().map(|s| s.channels[c] as f64).collect())
        .collect();
    let series: Vec<(&[f64], &RGBColor, &str)> = traces
        .iter()
        .enumerate()
        .map(|(c, t)| (t.as_slice(), &CHANNEL_COLORS[c], CHANNEL_NAMES[c]))
        .collect();
    plot_multi_series_f64_x(&times, &series, title, filename, "Time [s]", "Current", None)
}

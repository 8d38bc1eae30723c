// src/plot.rs

use crate::aggregate::SummaryReport;
use crate::error::{Result, VqaError};
use crate::metrics::MetricKind;
use log::{error, info};
use plotters::prelude::*;
use plotters::style::full_palette::{GREEN, ORANGE, PURPLE};
use quantiles::ckms::CKMS;
use std::path::{Path, PathBuf};

/// Renders the per-frame values of `kind` with summary lines and the
/// segment averages.
pub fn generate_plot(summary: &SummaryReport, kind: MetricKind, output_path: &Path) -> Result<()> {
    let metric = kind.name().to_uppercase();
    info!("Generating {} plot: {}", metric, output_path.display());

    // --- 1. Extract and Prepare Data ---
    let valid_scores: Vec<(u64, f64)> = summary
        .frames
        .iter()
        .filter_map(|frame| kind.value(frame).map(|score| (frame.frame, score)))
        .filter(|(_, score)| score.is_finite())
        .collect();

    if valid_scores.is_empty() {
        error!("No valid {} scores found to plot for {}", metric, output_path.display());
        return Err(VqaError::Plot(format!("No valid {} scores to plot", metric)));
    }

    let mut score_values: Vec<f64> = valid_scores.iter().map(|(_, s)| *s).collect();

    // --- 2. Calculate Statistics ---
    let count = score_values.len();
    let mean_val = score_values.iter().sum::<f64>() / count as f64;
    score_values.sort_by(|a, b| a.total_cmp(b));

    let mut quantiles_data = CKMS::<f64>::new(0.001);
    for score in &score_values {
        quantiles_data.insert(*score);
    }
    let get_percentile_value = |quantile: f64| -> f64 {
        quantiles_data
            .query(quantile)
            .map(|(rank, _)| {
                let index = rank.min(score_values.len().saturating_sub(1));
                score_values.get(index).copied().unwrap_or(f64::NAN)
            })
            .unwrap_or(f64::NAN)
    };
    let perc_1 = get_percentile_value(0.01);
    let perc_25 = get_percentile_value(0.25);
    let perc_75 = get_percentile_value(0.75);

    let min_score = score_values[0];
    let max_score = score_values[count - 1];

    // --- 3. Setup Plot ---
    let root = BitMapBackend::new(output_path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| VqaError::Plot(format!("Failed to fill plot background: {}", e)))?;

    let (y_min, y_max) = match kind {
        MetricKind::Vmaf => (perc_1.floor().max(0.0).min(95.0), 100.5),
        MetricKind::Ssim => ((min_score - 0.02).max(0.0), 1.005),
        _ => (min_score.floor() - 1.0, max_score.ceil() + 1.0),
    };
    let x_min = valid_scores[0].0;
    let x_max = valid_scores[valid_scores.len() - 1].0.max(x_min + 1);

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("{} Scores ({} Valid Frames)", metric, count),
            ("sans-serif", 24).into_font(),
        )
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(|e| VqaError::Plot(format!("Failed to build chart: {}", e)))?;

    // --- 4. Configure Mesh and Grid ---
    let y_label_format = |y: &f64| {
        if kind == MetricKind::Ssim {
            format!("{:.3}", y)
        } else {
            format!("{:.1}", y)
        }
    };
    let mut mesh = chart.configure_mesh();
    mesh.x_desc("Frame Number")
        .y_desc(format!("{} Score{}", metric, kind.unit()))
        .y_label_formatter(&y_label_format)
        .axis_desc_style(("sans-serif", 16))
        .label_style(("sans-serif", 14))
        .y_label_style(("sans-serif", 12).into_font().color(&BLACK.mix(0.6)));
    if kind == MetricKind::Vmaf {
        mesh.y_max_light_lines(10).y_labels(10);
    } else {
        mesh.y_max_light_lines(5).y_labels(5);
    }
    mesh.draw()
        .map_err(|e| VqaError::Plot(format!("Failed to draw mesh: {:?}", e)))?;

    // --- 5. Draw Data Series and Stat Lines ---
    chart
        .draw_series(LineSeries::new(
            valid_scores.iter().copied(),
            BLUE.mix(0.8).stroke_width(1),
        ))
        .map_err(|e| VqaError::Plot(format!("Failed to draw main series: {:?}", e)))?
        .label(format!("{} Scores", metric))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE.filled()));

    let stat_lines = [
        (format!("Mean: {:.2}", mean_val), mean_val, BLACK),
        (format!("1%:   {:.2}", perc_1), perc_1, RED),
        (format!("25%: {:.2}", perc_25), perc_25, ORANGE),
        (format!("75%: {:.2}", perc_75), perc_75, GREEN),
    ];
    for (label, value, color) in stat_lines {
        chart
            .draw_series(LineSeries::new(
                vec![(x_min, value), (x_max, value)],
                get_stat_line_style(color, 1),
            ))
            .map_err(|e| VqaError::Plot(format!("Failed to draw {} line: {:?}", label, e)))?
            .label(label)
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], get_stat_line_style(color, 1))
            });
    }

    // Segment averages as horizontal bars over each segment's frames.
    let segment_bars: Vec<Vec<(u64, f64)>> = summary
        .segments
        .iter()
        .filter_map(|segment| {
            segment
                .metrics
                .get(kind)
                .average()
                .map(|average| vec![(segment.start_frame, average), (segment.end_frame, average)])
        })
        .collect();
    if !segment_bars.is_empty() {
        let segment_count = segment_bars.len();
        chart
            .draw_series(
                segment_bars
                    .into_iter()
                    .map(|points| PathElement::new(points, get_stat_line_style(PURPLE, 3))),
            )
            .map_err(|e| VqaError::Plot(format!("Failed to draw segment averages: {:?}", e)))?
            .label(format!("Segment averages ({})", segment_count))
            .legend(|(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], get_stat_line_style(PURPLE, 3))
            });
    }

    // --- 6. Configure Legend ---
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerMiddle)
        .margin(10)
        .label_font(("sans-serif", 12))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(|e| VqaError::Plot(format!("Failed to draw legend: {:?}", e)))?;

    // --- 7. Finalize ---
    root.present()
        .map_err(|e| VqaError::Plot(format!("Failed to save plot: {:?}", e)))?;
    info!("Successfully generated {} plot: {}", metric, output_path.display());

    Ok(())
}

/// `<dir>/<prefix>.<metric>.png`. The prefix is kept whole, dots included.
pub fn plot_path(output_dir: &Path, prefix: &str, kind: MetricKind) -> PathBuf {
    output_dir.join(format!("{}.{}.png", prefix, kind.name()))
}

fn get_stat_line_style(color: RGBColor, stroke_width: u32) -> ShapeStyle {
    ShapeStyle {
        color: color.to_rgba(),
        filled: false,
        stroke_width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::config::AggregationConfig;
    use crate::metrics::{FrameMetric, MetricSeries};

    #[test]
    fn plot_names_keep_dotted_prefixes_apart() {
        let dir = Path::new("out");
        assert_eq!(
            plot_path(dir, "capture.v2", MetricKind::Vmaf),
            PathBuf::from("out/capture.v2.vmaf.png")
        );
        assert_ne!(
            plot_path(dir, "capture.v1", MetricKind::Psnr),
            plot_path(dir, "capture.v2", MetricKind::Psnr)
        );
    }

    #[test]
    fn metric_without_values_is_a_plot_error() {
        let frames = (1..=4u64)
            .map(|frame| FrameMetric {
                frame,
                vmaf: Some(88.0),
                ..Default::default()
            })
            .collect();
        let summary = aggregate(
            MetricSeries::from_frames(frames).unwrap(),
            &AggregationConfig::default(),
        );
        let dir = tempfile::tempdir().unwrap();
        let result = generate_plot(&summary, MetricKind::Ssim, &dir.path().join("ssim.png"));
        assert!(matches!(result, Err(VqaError::Plot(_))));
    }
}

//! Extensions that ship with BioLink.

use super::{Extension, ExtensionContext, ExtensionLogHeader, ExperimentConstants};
use anyhow::{Context, Result};
use std::time::Duration;

/// Running per-channel sums between two reports.
#[derive(Debug, Clone)]
struct ChannelSummary {
    sums: Vec<u64>,
    count: u64,
}

impl ChannelSummary {
    fn new(channels: usize) -> Self {
        Self {
            sums: vec![0; channels],
            count: 0,
        }
    }

    fn add(&mut self, values: &[u16]) {
        for (sum, value) in self.sums.iter_mut().zip(values) {
            *sum += u64::from(*value);
        }
        self.count += 1;
    }

    fn means(&self) -> Vec<f64> {
        let count = self.count.max(1) as f64;
        self.sums.iter().map(|sum| *sum as f64 / count).collect()
    }

    fn describe(&self, names: &[String]) -> String {
        names
            .iter()
            .zip(self.means())
            .map(|(name, mean)| format!("{}={:.1}", name, mean))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn clear(&mut self) {
        self.sums.iter_mut().for_each(|sum| *sum = 0);
        self.count = 0;
    }
}

/// Starting point for new extensions: consumes bio data, prints channel
/// means four times a second, marks and logs every full second.
pub struct Template;

impl Extension for Template {
    fn log_header(&self, constants: &ExperimentConstants) -> Option<ExtensionLogHeader> {
        let mut columns = vec!["frame".to_string(), "second".to_string()];
        columns.extend(constants.channel_header.iter().map(|c| format!("{}_mean", c)));
        Some(ExtensionLogHeader {
            lines: vec![format!("sample_rate: {}", constants.sample_rate)],
            columns,
        })
    }

    fn run(&mut self, ctx: &mut ExtensionContext) -> Result<()> {
        let fs = u64::from(ctx.constants().sample_rate.max(1));
        let quarter = (fs / 4).max(1);
        let names = ctx.constants().channel_header.clone();
        let emitter = ctx.emitter();
        let notify = ctx.emitter();
        ctx.on_end_request(move || notify.console("template: end of run requested"));
        let log = ctx.log().cloned();
        let mut quarter_summary = ChannelSummary::new(names.len());
        let mut second_summary = ChannelSummary::new(names.len());
        ctx.console(format!(
            "template running at {} Hz on {}",
            fs,
            names.join(",")
        ));

        let processing = ctx.start_bio_data_processing(move |frame, values| {
            quarter_summary.add(values);
            second_summary.add(values);
            let done = frame + 1;
            if done % quarter == 0 {
                emitter.console(format!("frame {}: {}", frame, quarter_summary.describe(&names)));
                quarter_summary.clear();
            }
            if done % fs == 0 {
                let second = done / fs;
                if let Err(err) = emitter.emit_event(&format!("second {}", second), Some(frame as i64)) {
                    emitter.console(format!("marker for second {} lost: {}", second, err));
                }
                if let Some(log) = &log {
                    let mut row = vec![frame.to_string(), second.to_string()];
                    row.extend(second_summary.means().iter().map(|m| format!("{:.1}", m)));
                    if let Err(err) = log.append_line(&row) {
                        emitter.console(format!("{:#}", err));
                    }
                }
                second_summary.clear();
            }
        })?;

        while !ctx.wait_for_end(Duration::from_secs(1)) {}
        processing.stop();
        ctx.console("template done");
        Ok(())
    }
}

/// Emits `count` markers `interval_ms` apart, then asks for the end of the
/// run. Options: `count` (default 3), `interval_ms` (default 1000).
pub struct Countdown;

impl Countdown {
    fn option<T: std::str::FromStr>(ctx: &ExtensionContext, key: &str, default: T) -> Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match ctx.option(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("countdown option {}='{}'", key, raw)),
            None => Ok(default),
        }
    }
}

impl Extension for Countdown {
    fn log_header(&self, _constants: &ExperimentConstants) -> Option<ExtensionLogHeader> {
        Some(ExtensionLogHeader {
            lines: Vec::new(),
            columns: vec!["remaining".into(), "frame".into()],
        })
    }

    fn run(&mut self, ctx: &mut ExtensionContext) -> Result<()> {
        let count: u32 = Self::option(ctx, "count", 3)?;
        let interval = Duration::from_millis(Self::option(ctx, "interval_ms", 1000)?);
        for remaining in (1..=count).rev() {
            if ctx.wait_for_end(interval) {
                ctx.console("countdown interrupted by the end of the run");
                return Ok(());
            }
            let frame = ctx.emit_event(&format!("countdown {}", remaining), None)?;
            ctx.console(format!("countdown {} at frame {}", remaining, frame));
            ctx.log_append_line(&[remaining.to_string(), frame.to_string()])?;
        }
        ctx.request_end_of_run("countdown finished")?;
        ctx.wait_for_end(Duration::from_secs(30));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_channel_means() {
        let mut summary = ChannelSummary::new(2);
        summary.add(&[10, 100]);
        summary.add(&[20, 300]);
        assert_eq!(summary.means(), vec![15.0, 200.0]);
        assert_eq!(
            summary.describe(&["ecg".to_string(), "eda".to_string()]),
            "ecg=15.0 eda=200.0"
        );
        summary.clear();
        assert_eq!(summary.means(), vec![0.0, 0.0]);
    }

    #[test]
    fn template_logs_one_mean_column_per_channel() {
        let constants = ExperimentConstants {
            extension_name: "template".into(),
            subject_id: "s".into(),
            experiment_id: "e".into(),
            log_dir: "logs".into(),
            file_base: "logs/e_s".into(),
            start_time: String::new(),
            channel_header: vec!["ecg".into(), "eda".into()],
            sample_rate: 1000,
            no_log: false,
            options: Default::default(),
        };
        let header = Template.log_header(&constants).unwrap();
        assert_eq!(header.columns, vec!["frame", "second", "ecg_mean", "eda_mean"]);
    }
}

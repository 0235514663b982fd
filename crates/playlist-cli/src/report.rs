//! Terminal rendering of one run: log text as it grows, then the playlist.

use std::io::{self, Write};

use playlist_proto::protocol::{Broadcast, RunId, RunOutcome, RunPhase, RunSnapshot};

pub struct RunReport<W: Write> {
    run_id: RunId,
    out: W,
    printed_log: String,
    outcome: Option<RunOutcome>,
}

impl<W: Write> RunReport<W> {
    pub fn new(run_id: RunId, out: W) -> Self {
        Self {
            run_id,
            out,
            printed_log: String::new(),
            outcome: None,
        }
    }

    /// Feed one daemon message.  Returns the outcome once the run is
    /// finished, after the playlist (or failure sentinel) has been printed.
    pub fn apply(&mut self, broadcast: &Broadcast) -> io::Result<Option<RunOutcome>> {
        match broadcast {
            Broadcast::Log { run_id, text } if *run_id == self.run_id => {
                self.print_log(text)?;
                Ok(None)
            }
            Broadcast::Playlist { run_id, outcome } if *run_id == self.run_id => {
                self.outcome = Some(outcome.clone());
                Ok(None)
            }
            Broadcast::State { data } | Broadcast::Hello { state: data, .. } => {
                self.apply_snapshot(data)
            }
            _ => Ok(None),
        }
    }

    fn apply_snapshot(&mut self, snapshot: &RunSnapshot) -> io::Result<Option<RunOutcome>> {
        if snapshot.run_id != Some(self.run_id) {
            return Ok(None);
        }
        self.print_log(&snapshot.log)?;
        if let Some(outcome) = &snapshot.outcome {
            self.outcome = Some(outcome.clone());
        }
        if snapshot.phase != RunPhase::Finished {
            return Ok(None);
        }

        let outcome = self.outcome.clone().unwrap_or(RunOutcome::Cancelled);
        if !self.printed_log.is_empty() && !self.printed_log.ends_with('\n') {
            writeln!(self.out)?;
        }
        writeln!(self.out, "{}", outcome.display_text())?;
        self.out.flush()?;
        Ok(Some(outcome))
    }

    /// Print only what was appended since the last call.  A log that no
    /// longer extends what we printed (truncated or rewritten) is printed
    /// again in full.
    fn print_log(&mut self, text: &str) -> io::Result<()> {
        if text == self.printed_log {
            return Ok(());
        }
        match text.strip_prefix(self.printed_log.as_str()) {
            Some(appended) => write!(self.out, "{}", appended)?,
            None => {
                if !self.printed_log.is_empty() && !self.printed_log.ends_with('\n') {
                    writeln!(self.out)?;
                }
                write!(self.out, "{}", text)?;
            }
        }
        self.out.flush()?;
        self.printed_log = text.to_string();
        Ok(())
    }
}

/// Multi-line summary for `playlist status`.
pub fn describe_snapshot(snapshot: &RunSnapshot) -> String {
    let Some(run_id) = snapshot.run_id else {
        return "no run yet".to_string();
    };

    let mut lines = vec![format!("run {}: {:?}", run_id, snapshot.phase)];
    if let Some(command) = &snapshot.command {
        lines.push(format!("command: {}", command));
    }
    if let Some(poll) = snapshot.poll_outcome {
        lines.push(format!("log polling: {:?}", poll));
    }
    if let Some(outcome) = &snapshot.outcome {
        lines.push(format!("result: {}", outcome.describe()));
        lines.push(outcome.display_text().to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use playlist_proto::protocol::FAILURE_SENTINEL;

    fn output(report: RunReport<Vec<u8>>) -> String {
        String::from_utf8(report.out).unwrap()
    }

    fn finished(run_id: RunId, log: &str, outcome: RunOutcome) -> Broadcast {
        Broadcast::State {
            data: RunSnapshot {
                rev: 10,
                run_id: Some(run_id),
                phase: RunPhase::Finished,
                command: Some("-g g.json -d 10 -u 20".to_string()),
                log: log.to_string(),
                poll_outcome: None,
                outcome: Some(outcome),
            },
        }
    }

    #[test]
    fn test_log_printed_incrementally() {
        let mut report = RunReport::new(1, Vec::new());
        for text in ["a\n", "a\nb\n", "a\nb\n", "a\nb\nc\n"] {
            let log = Broadcast::Log {
                run_id: 1,
                text: text.to_string(),
            };
            assert_eq!(report.apply(&log).unwrap(), None);
        }
        assert_eq!(output(report), "a\nb\nc\n");
    }

    #[test]
    fn test_rewritten_log_printed_again() {
        let mut report = RunReport::new(1, Vec::new());
        for text in ["first", "other\n"] {
            report
                .apply(&Broadcast::Log {
                    run_id: 1,
                    text: text.to_string(),
                })
                .unwrap();
        }
        assert_eq!(output(report), "first\nother\n");
    }

    #[test]
    fn test_other_runs_ignored() {
        let mut report = RunReport::new(2, Vec::new());
        report
            .apply(&Broadcast::Log {
                run_id: 1,
                text: "stale".to_string(),
            })
            .unwrap();
        let done = report
            .apply(&finished(1, "stale", RunOutcome::Cancelled))
            .unwrap();
        assert_eq!(done, None);
        assert_eq!(output(report), "");
    }

    #[test]
    fn test_failure_prints_sentinel() {
        let mut report = RunReport::new(4, Vec::new());
        let outcome = RunOutcome::GeneratorFailed { code: Some(1) };
        let done = report
            .apply(&finished(4, "Playlist Creator - started\n", outcome.clone()))
            .unwrap();
        assert_eq!(done, Some(outcome));
        assert_eq!(
            output(report),
            format!("Playlist Creator - started\n{}\n", FAILURE_SENTINEL)
        );
    }

    #[test]
    fn test_playlist_printed_after_log() {
        let mut report = RunReport::new(3, Vec::new());
        let outcome = RunOutcome::Playlist {
            text: "Song - Artist link".to_string(),
        };
        report
            .apply(&Broadcast::Playlist {
                run_id: 3,
                outcome: outcome.clone(),
            })
            .unwrap();
        // Still running: nothing final yet.
        let running = Broadcast::State {
            data: RunSnapshot {
                run_id: Some(3),
                phase: RunPhase::Running,
                log: "working".to_string(),
                ..RunSnapshot::default()
            },
        };
        assert_eq!(report.apply(&running).unwrap(), None);

        let done = report.apply(&finished(3, "working", outcome.clone())).unwrap();
        assert_eq!(done, Some(outcome));
        assert_eq!(output(report), "working\nSong - Artist link\n");
    }

    #[test]
    fn test_describe_snapshot() {
        assert_eq!(describe_snapshot(&RunSnapshot::default()), "no run yet");

        let Broadcast::State { data } = finished(7, "", RunOutcome::Cancelled) else {
            unreachable!();
        };
        let text = describe_snapshot(&data);
        assert!(text.starts_with("run 7: Finished"));
        assert!(text.contains("command: -g g.json -d 10 -u 20"));
        assert!(text.contains("result: run cancelled"));
        assert!(text.ends_with(FAILURE_SENTINEL));
    }
}

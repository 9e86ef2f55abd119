use anyhow::{Context, Result};
use log::info;
use rand::Rng;
use rand::rngs::ThreadRng;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;
use trialflow_core::SharedRecorder;
use trialflow_experiment::{
    Event, ExperimentHandler, Method, MultiStairConfig, MultiStairHandler, Scheduler, Session,
};
use trialflow_timing::PacedFrameDriver;

/// Threshold of the simulated observer, in the staircases' own units.
const OBSERVER_THRESHOLD: f64 = 0.5;
const OBSERVER_SLOPE: f64 = 3.5;

/// Headless interleaved-staircase session answered by a simulated observer.
pub struct App {
    session: Session,
    experiment: Rc<RefCell<ExperimentHandler>>,
    handler: Rc<RefCell<MultiStairHandler>>,
    driver: PacedFrameDriver,
}

impl App {
    pub fn new(config: MultiStairConfig, refresh_rate_hz: f64) -> Result<Self> {
        let session = Session::new();
        let experiment = Rc::new(RefCell::new(ExperimentHandler::new("experiment", &session)));
        let recorder: SharedRecorder = experiment.clone();

        let mut handler = MultiStairHandler::new(config)?;
        handler.attach_recorder(recorder);
        experiment.borrow_mut().add_loop(handler.name());

        Ok(Self {
            session,
            experiment,
            handler: Rc::new(RefCell::new(handler)),
            driver: PacedFrameDriver::new(refresh_rate_hz),
        })
    }

    /// Reads a `MultiStairConfig` from JSON. A bare array is taken as the
    /// list of staircase conditions.
    pub fn load_config(path: &str) -> Result<MultiStairConfig> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let value: Value = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
        let config = match value {
            Value::Array(conditions) => MultiStairConfig {
                conditions,
                ..MultiStairConfig::default()
            },
            other => serde_json::from_value(other)?,
        };
        info!("loaded {} condition(s) from {path}", config.conditions.len());
        Ok(config)
    }

    /// Two linear staircases approaching the threshold from either side.
    pub fn builtin_config() -> MultiStairConfig {
        MultiStairConfig {
            name: "contrast".to_string(),
            method: Method::Random,
            n_trials: 30,
            conditions: vec![
                json!({
                    "label": "descending", "startVal": 0.9, "stepSizes": [0.2, 0.1, 0.05],
                    "stepType": "lin", "minVal": 0.0, "maxVal": 1.0, "nUp": 1, "nDown": 2
                }),
                json!({
                    "label": "ascending", "startVal": 0.1, "stepSizes": [0.2, 0.1, 0.05],
                    "stepType": "lin", "minVal": 0.0, "maxVal": 1.0, "nUp": 1, "nDown": 2
                }),
            ],
            ..MultiStairConfig::default()
        }
    }

    fn build_scheduler(&self) -> Scheduler {
        let mut root = Scheduler::named("root", &self.session);

        let handler = Rc::clone(&self.handler);
        root.add_task(move || {
            let handler = handler.borrow();
            println!("=== INTERLEAVED STAIRCASES: {} ===", handler.name());
            for stair in handler.staircases() {
                println!("  {}", stair.attributes());
            }
            println!();
            Ok(Event::FlipNext)
        });

        let mut trials = Scheduler::named("trials", &self.session);
        let handler = Rc::clone(&self.handler);
        let experiment = Rc::clone(&self.experiment);
        let mut rng: ThreadRng = rand::rng();
        trials.add_task(move || {
            let mut handler = handler.borrow_mut();
            let Some(trial) = handler.next_trial() else {
                return Ok(Event::Next);
            };
            let intensity = trial["intensity"].as_f64().unwrap_or_default();
            let response = simulated_response(&mut rng, intensity);
            {
                let mut experiment = experiment.borrow_mut();
                experiment.add_data("label", trial["label"].clone());
                experiment.add_data("intensity", intensity);
            }
            handler.add_response(response, Some(intensity))?;
            experiment.borrow_mut().next_entry();
            Ok(Event::FlipRepeat)
        });
        root.add_scheduler(trials);

        let experiment = Rc::clone(&self.experiment);
        root.add_task(move || {
            experiment.borrow_mut().end();
            Ok(Event::Quit)
        });
        root
    }

    pub fn run(mut self) -> Result<()> {
        println!("=== TRIALFLOW SESSION ===");
        println!("Platform: {}", std::env::consts::OS);
        println!(
            "Frame period: {:.3} ms\n",
            self.driver.frame_period().as_secs_f64() * 1e3
        );

        let mut root = self.build_scheduler();
        root.start(&mut self.driver)?;

        let stats = self.driver.calibration_stats();
        println!("Timing:");
        println!(
            "  {:.3} ms/frame, {:.1} Hz, jitter {:.3} ms, {} dropped frame(s)",
            stats.average_frame_time_ns / 1e6,
            stats.effective_fps,
            stats.jitter_ns / 1e6,
            self.driver.dropped_frames()
        );

        let handler = self.handler.borrow();
        let experiment = self.experiment.borrow();
        println!("\nResults ({} trials, {} flips):", experiment.entries().len(), self.driver.flips());
        for stair in handler.staircases() {
            println!(
                "  {:<12} final intensity {:.3}{}",
                stair.name(),
                stair.intensity(),
                if stair.is_finished() { "" } else { " (unfinished)" }
            );
        }
        println!("\nExperiment completed.");
        Ok(())
    }
}

/// Two-alternative observer with a Weibull psychometric function.
fn simulated_response(rng: &mut impl Rng, intensity: f64) -> i64 {
    let x = (intensity / OBSERVER_THRESHOLD).max(0.0);
    let p_correct = 1.0 - 0.5 * (-x.powf(OBSERVER_SLOPE)).exp();
    (rng.random::<f64>() < p_correct) as i64
}

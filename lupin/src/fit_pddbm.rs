use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use lupin::monitor::log_channels;
use lupin::{parse_schedule, Dbm, DbmOptions, Labels, Pddbm, PddbmOptions, S3c, S3cOptions};
use matrix_util::common_io::write_lines;
use matrix_util::traits::{ConvertMatOps, IoOps, SampleOps};
use matrix_util::utils::generate_minibatch_intervals;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use candle_core::{DType, Device, Tensor};

/// Everything a training run needs, as read from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LupinConfig {
    pub s3c: S3cOptions,
    pub dbm: DbmOptions,
    pub pddbm: PddbmOptions,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Data matrix, one example per row (tab-separated unless `--delim`)
    #[arg(long, short = 'i', conflicts_with = "simulate")]
    data_file: Option<Box<str>>,

    /// Column delimiter of the data file; whitespace if `ws`
    #[arg(long, default_value = "\t")]
    delim: Box<str>,

    /// Header lines to skip in the data file
    #[arg(long, default_value_t = 0)]
    skip: usize,

    /// Simulate this many examples instead of reading a file
    #[arg(long)]
    simulate: Option<usize>,

    /// Number of visible units of simulated data
    #[arg(long, default_value_t = 16)]
    sim_nvis: usize,

    /// JSON configuration (see `lupin config`)
    #[arg(long, short = 'c')]
    config: Option<Box<str>>,

    /// Number of spike/slab pairs (overrides the config)
    #[arg(long)]
    nhid: Option<usize>,

    /// Widths of the DBM hidden layers, comma-separated (overrides the config)
    #[arg(long, value_delimiter(','))]
    layers: Option<Vec<usize>>,

    /// Inference schedule, e.g. "h:1,s:1,g:0" (overrides the config)
    #[arg(long)]
    schedule: Option<Box<str>>,

    /// Learning rate (overrides the config)
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Minibatch size
    #[arg(long, short = 'b', default_value_t = 100)]
    batch_size: usize,

    /// Number of passes over the data
    #[arg(long, short = 'e', default_value_t = 10)]
    epochs: usize,

    /// Compute in double precision
    #[arg(long, default_value_t = false)]
    f64: bool,

    /// Random seed of the simulation and the minibatch order
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// Show a progress bar
    #[arg(long, default_value_t = false)]
    progress: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output file; stdout if omitted
    #[arg(long, short)]
    out: Option<Box<str>>,
}

pub fn write_default_config(args: &ConfigArgs) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(&LupinConfig::default())?;
    match &args.out {
        Some(out) => write_lines(&[text.into_boxed_str()], out),
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}

/// Sparse codes through a random dictionary plus a little noise
fn simulate_data(nn: usize, nvis: usize, seed: u64) -> anyhow::Result<Array2<f32>> {
    let ncode = (nvis / 2).max(1);
    let dict = Array2::<f32>::rnorm(ncode, nvis, seed)?;
    let on = Array2::<f32>::runif(nn, ncode, seed.wrapping_add(1))?.mapv(|u| if u < 0.2 { 1.0 } else { 0.0 });
    let slab = Array2::<f32>::rnorm(nn, ncode, seed.wrapping_add(2))?.mapv(|z| 1.0 + 0.5 * z);
    let noise = Array2::<f32>::rnorm(nn, nvis, seed.wrapping_add(3))? * 0.1_f32;
    Ok((on * slab).dot(&dict) + noise)
}

fn read_config(args: &TrainArgs, nvis: usize) -> anyhow::Result<LupinConfig> {
    let mut config = match &args.config {
        Some(file) => {
            let text = std::fs::read_to_string(&**file)?;
            serde_json::from_str::<LupinConfig>(&text)?
        }
        None => LupinConfig::default(),
    };

    config.s3c.nvis = nvis;
    if let Some(nhid) = args.nhid {
        config.s3c.nhid = nhid;
    }
    if config.s3c.nhid == 0 {
        config.s3c.nhid = nvis;
    }
    config.dbm.nvis = config.s3c.nhid;

    if let Some(layers) = &args.layers {
        config.dbm.layer_sizes = layers.clone();
    }
    if config.dbm.layer_sizes.is_empty() {
        config.dbm.layer_sizes = vec![(config.s3c.nhid / 2).max(1)];
    }

    if let Some(schedule) = &args.schedule {
        config.pddbm.inference.schedule = parse_schedule(schedule)?;
    }
    if config.pddbm.inference.schedule.is_empty() {
        config.pddbm.inference.schedule = parse_schedule("h:1 s:1 g:0")?;
    }
    if let Some(lr) = args.learning_rate {
        config.pddbm.learning_rate = lr;
    }
    Ok(config)
}

pub fn fit_pddbm(args: &TrainArgs) -> anyhow::Result<()> {
    // 1. data
    let data = match (&args.data_file, args.simulate) {
        (Some(file), _) => {
            let delim = match &*args.delim {
                "ws" => None,
                d => Some(d),
            };
            Array2::<f32>::read_file_delim(file, delim, args.skip)?
        }
        (None, Some(nn)) => simulate_data(nn, args.sim_nvis, args.seed)?,
        (None, None) => anyhow::bail!("either --data-file or --simulate is needed"),
    };
    let (nn, nvis) = data.dim();
    info!("data: {} x {}", nn, nvis);

    let dtype = if args.f64 { DType::F64 } else { DType::F32 };
    let data = data.to_tensor(&Device::Cpu)?.to_dtype(dtype)?;

    // 2. model
    let config = read_config(args, nvis)?;
    write_lines(
        &[serde_json::to_string_pretty(&config)?.into_boxed_str()],
        &format!("{}.config.json", args.out),
    )?;

    let s3c = S3c::new(config.s3c.clone(), dtype)?;
    let dbm = Dbm::new(config.dbm.clone(), dtype)?;
    let mut model = Pddbm::new(s3c, dbm, config.pddbm.clone())?;

    // 3. minibatches
    let intervals = generate_minibatch_intervals(nn, args.batch_size);
    let pb = ProgressBar::new((args.epochs * intervals.len()) as u64);
    if !args.progress {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    for epoch in 0..args.epochs {
        let order = Tensor::runif(1, nn, args.seed.wrapping_add(epoch as u64))?
            .flatten_all()?
            .arg_sort_last_dim(true)?;
        let shuffled = data.index_select(&order, 0)?;

        for &(lb, ub) in intervals.iter() {
            let batch = shuffled.narrow(0, lb, ub - lb)?;
            model.learn_mini_batch(&batch, &Labels::Unlabeled)?;
            pb.inc(1);
        }
        info!("[{}] examples seen: {}", epoch + 1, model.examples_seen());
    }
    pb.finish_and_clear();

    // 4. outputs
    let first = data.narrow(0, 0, args.batch_size.min(nn))?;
    let channels = model.monitoring_channels(&first, &Labels::Unlabeled)?;
    log_channels("final", &channels);
    let lines: Vec<Box<str>> = channels
        .iter()
        .map(|(name, x)| format!("{}\t{}", name, x).into_boxed_str())
        .collect();
    write_lines(&lines, &format!("{}.channels.tsv", args.out))?;

    Array2::<f32>::from_tensor(&model.visible_weights())?
        .to_tsv(&format!("{}.visible_weights.tsv.gz", args.out))?;
    Array2::<f32>::from_tensor(&model.projected_weights()?)?
        .to_tsv(&format!("{}.projected_weights.tsv.gz", args.out))?;

    info!("wrote {}.*", args.out);
    Ok(())
}

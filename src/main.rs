//! Trains a small classifier on a toy dataset using the optimizer wrappers of `grad_utils`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- --devices 2 --num-minibatches 4 --trainable-scopes fc2,fc3
//! ```
//!
//! Every step is split into `--num-minibatches` minibatches and every minibatch
//! across `--devices` towers. Tower gradients are averaged, minibatch gradients
//! accumulated and the variables updated once per step.

use std::{
    error::Error,
    fs::{self, File},
    path::{Path, PathBuf},
};

use clap::Parser;
use grad_utils::{
    dataloader::{Batch, DataLoader},
    datasets::{Dataset, load_dataset},
    graph::Graph,
    layers::{Conv, Fc, LayerError, Recorder},
    loss::sparse_softmax_cross_entropy,
    optim::{AggregationMethod, ClipOptimizer, MinibatchOptimizer, MomentumOptimizer},
    tensor::Tensor,
    values::Value,
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

type Trainer = MinibatchOptimizer<ClipOptimizer<MomentumOptimizer>>;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::XOR)]
    dataset: Dataset,
    #[clap(short, long, default_value_t = 500)]
    class_size: usize,
    #[clap(short, long, default_value_t = 32)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 20)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.05)]
    lr: f32,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[clap(short, long, default_value_t = 5)]
    print_epochs: usize,
    #[clap(long, default_value_t = 16)]
    hidden_units: usize,
    /// Minibatches accumulated into one update
    #[clap(long, default_value_t = 2)]
    num_minibatches: usize,
    /// Towers every minibatch is split across
    #[clap(long, default_value_t = 1)]
    devices: usize,
    /// Disables clipping gradients to [-1, 1]
    #[clap(long, default_value_t = false)]
    no_clip: bool,
    /// Only train the variables of these layers, e.g. `fc2,fc3`
    #[clap(long, value_delimiter = ',')]
    trainable_scopes: Vec<String>,
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Writes the log to this file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,
    /// Writes the recorded layer parameters as JSON to this file
    #[clap(long)]
    metadata: Option<PathBuf>,
}

fn init_logger(log_file: Option<&Path>) -> std::io::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        builder.target(env_logger::Target::Pipe(Box::new(File::create(path)?)));
    }
    builder.init();
    Ok(())
}

// Points are fed as 1x1 images with one channel per coordinate
fn record_network(hidden_units: usize, n_classes: usize, seed: u64) -> Result<Recorder, LayerError> {
    let mut rec = Recorder::default().with_seed(seed);
    rec.layer("conv1")?;
    rec.conv(
        Conv::new(hidden_units)
            .with_ksize(1)
            .with_bias(0.1)
            .with_weight_decay(1e-4),
    )?;
    rec.layer("fc2")?;
    rec.fc(Fc::new(hidden_units).with_bias(0.1).with_dropout(None))?;
    rec.layer("fc3")?;
    rec.fc(
        Fc::new(n_classes)
            .with_bias(0.0)
            .with_activation(None)
            .with_dropout(None),
    )?;
    Ok(rec)
}

fn as_images(inputs: &Tensor) -> Result<Tensor, Box<dyn Error>> {
    let &[n, dim] = inputs.shape() else {
        return Err(format!("expected [batch, dim] inputs, got {:?}", inputs.shape()).into());
    };
    Ok(inputs.reshape(&[n, 1, 1, dim])?)
}

fn correct_predictions(logits: &Tensor, labels: &[usize]) -> usize {
    let classes = logits.shape().last().copied().unwrap_or(1).max(1);
    logits
        .values()
        .chunks(classes)
        .zip(labels)
        .filter(|(row, label)| {
            let pred = row
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.data().total_cmp(&b.data()))
                .map(|(i, _)| i);
            pred == Some(**label)
        })
        .count()
}

/// Forward pass of one tower: data loss plus weight decay, and the number of hits
fn tower_loss(
    recorder: &Recorder,
    graph: &mut Graph,
    shard: &Batch,
) -> Result<(Value, usize), Box<dyn Error>> {
    let logits = recorder.build(graph, as_images(&shard.inputs)?)?.into_output();
    let loss = sparse_softmax_cross_entropy(&logits, &shard.labels)?;
    let total = &loss + &graph.regularization_loss();
    Ok((total, correct_predictions(&logits, &shard.labels)))
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logger(args.log_file.as_deref())?;

    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let (data, labels) = load_dataset(args.dataset, args.class_size, &mut rng);
    let n_classes = labels.iter().max().map_or(1, |m| m + 1);
    let dim = data.first().map_or(0, |d| d.len());
    let data_loader = DataLoader::new(data, labels, args.batch_size, true)?;
    log::info!(
        "dataset {} with {} samples, {} classes",
        args.dataset,
        data_loader.len(),
        n_classes
    );

    let recorder = record_network(args.hidden_units, n_classes, args.seed)?;
    if let Some(path) = &args.metadata {
        fs::write(path, recorder.to_json()?)?;
        log::info!("layer parameters written to '{}'", path.display());
    }

    // the first build creates the variables, every later one reuses them
    let mut graph = Graph::new(args.seed);
    recorder.build(&mut graph, Tensor::zeros(&[1, 1, 1, dim]))?;
    graph.reuse_variables();
    let global_step = graph.global_step().clone();

    let mut clip = ClipOptimizer::new(MomentumOptimizer::new(args.lr, args.momentum))
        .with_clip(!args.no_clip);
    if !args.trainable_scopes.is_empty() {
        clip = clip.with_trainable_names(args.trainable_scopes.iter().cloned());
    }
    let mut optim: Trainer = MinibatchOptimizer::new(clip);
    let num_minibatches = args.num_minibatches.max(1);

    for epoch in 0..args.epochs {
        let batches = data_loader.iter(&mut rng).collect::<Result<Vec<_>, _>>()?;
        let mut epoch_loss = 0.0;
        let mut hits = 0;

        for step in batches.chunks(num_minibatches) {
            let mut grads = vec![];
            for batch in step {
                let mut towers = vec![];
                for shard in batch.split(args.devices)? {
                    let (loss, correct) = tower_loss(&recorder, &mut graph, &shard)?;
                    epoch_loss += loss.data() * shard.len() as f32;
                    hits += correct;
                    towers.push(optim.compute_gradients(&graph, &loss, None)?);
                }
                let averaged = Trainer::aggregate_gradients(&towers, AggregationMethod::Average)?;
                grads = optim.accumulate_gradients(&averaged, step.len())?.1;
            }
            optim.apply_gradients(&mut graph, &grads, Some(&global_step))?;
        }

        if epoch % args.print_epochs.max(1) == 0 || epoch + 1 == args.epochs {
            log::info!(
                "epoch: {}, step: {}, loss: {:.4}, accuracy: {:.3}",
                epoch + 1,
                global_step.get(),
                epoch_loss / data_loader.len().max(1) as f32,
                hits as f32 / data_loader.len().max(1) as f32
            );
        }
    }
    Ok(())
}

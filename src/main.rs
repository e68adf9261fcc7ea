use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use opframe::{
    InferOptions, InferredOp, OpError, OpRegistryBuilder, SbpSignature, TensorDesc,
    generate_backward, infer_job, load_job_from_path, registry,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Infer tensor descriptors and parallelization signatures of operator jobs", long_about = None)]
struct Cli {
    /// Path to a JSON job file with `tensors` and `ops`.
    job: Option<PathBuf>,
    /// Print the registered op types and exit.
    #[arg(long)]
    list_ops: bool,
    /// Emit the inference result as JSON.
    #[arg(long)]
    json: bool,
    /// Accept attributes the op type does not declare.
    #[arg(long)]
    allow_undeclared_attrs: bool,
    /// Upper bound on candidate signatures per op.
    #[arg(long)]
    max_signatures: Option<usize>,
    /// Generate backward ops seeded at this logical blob name.
    #[arg(long)]
    backward: Option<String>,
}

#[derive(Serialize)]
struct OpReport<'a> {
    name: &'a str,
    op_type: &'a str,
    outputs: BTreeMap<String, &'a TensorDesc>,
    sbp_signatures: &'a [SbpSignature],
    header_only_inputs: Vec<String>,
}

impl<'a> OpReport<'a> {
    fn new(op: &'a InferredOp) -> Self {
        Self {
            name: op.op_name(),
            op_type: op.conf.op_type_name(),
            outputs: op
                .output_descs
                .iter()
                .map(|(arg, desc)| (arg.bn(), desc))
                .collect(),
            sbp_signatures: op.sbp_signatures.as_slice(),
            header_only_inputs: op
                .input_modifiers
                .iter()
                .filter(|(_, modifier)| modifier.use_header_only)
                .map(|(arg, _)| arg.bn())
                .collect(),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("OPFRAME_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), OpError> {
    let cli = Cli::parse();
    let registry = registry::install_global(OpRegistryBuilder::with_builtins()?.seal())?;

    if cli.list_ops {
        for name in registry.op_type_names() {
            println!("{}", name);
        }
        return Ok(());
    }
    let Some(job_path) = cli.job else {
        eprintln!("error: a job file is required unless --list-ops is given");
        std::process::exit(2);
    };

    let mut options = InferOptions::default();
    if cli.allow_undeclared_attrs {
        options.reject_undeclared_attrs = false;
    }
    if let Some(limit) = cli.max_signatures {
        options.max_sbp_signatures = limit;
    }

    let job = load_job_from_path(&job_path)?;
    let inference = infer_job(registry, &job, &options)?;
    let backward = match &cli.backward {
        Some(loss) => Some(generate_backward(
            registry,
            &inference,
            loss,
            &format!("{}_grad", loss),
        )?),
        None => None,
    };

    if cli.json {
        let reports: Vec<_> = inference.ops.iter().map(OpReport::new).collect();
        let mut value = serde_json::json!({ "ops": reports });
        if let Some(backward) = &backward {
            let ops: Vec<_> = backward.ops.iter().map(|op| op.op_conf()).collect();
            value["backward"] = serde_json::json!({
                "ops": ops,
                "tensor_grads": backward.tensor_grads,
            });
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "Inferred job `{}` with {} ops.",
        job_path.display(),
        inference.ops.len()
    );
    for op in &inference.ops {
        println!("{} ({}):", op.op_name(), op.conf.op_type_name());
        for (arg, desc) in &op.output_descs {
            println!(
                "  - {}: {:?} {} batch_axis={:?}",
                arg.bn(),
                desc.data_type,
                desc.shape,
                desc.batch_axis
            );
        }
        println!("  {} sbp signature(s):", op.sbp_signatures.len());
        for signature in &op.sbp_signatures {
            println!("    {}", signature);
        }
    }
    if let Some(backward) = backward {
        println!("Backward ops:");
        for op in &backward.ops {
            println!("  - {} ({})", op.op_name(), op.op_type_name());
        }
        for (lbn, grad) in &backward.tensor_grads {
            println!("  d({}) = {}", lbn, grad);
        }
    }
    Ok(())
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::Array2;
use precis::{
    CooTriplets, EstimatorConfig, FieldShape, GridPoint, PointOrder, PredecessorIndex,
    PrecisionEstimator, RunConfig, StencilConfig,
};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "precis")]
#[command(about = "Sparse ensemble precision estimation on a 4D grid", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect predecessor neighborhoods for a grid and stencil.
    #[command(alias = "preds")]
    Predecessors(PredecessorArgs),
    /// Fit the sparse precision factors from a flattened ensemble.
    #[command(alias = "fit")]
    Estimate(EstimateArgs),
}

#[derive(Args, Debug)]
struct GridArgs {
    /// Field shape as layers,variables,latitudes,longitudes.
    #[arg(long, value_delimiter = ',')]
    shape: Vec<usize>,
    #[arg(long, default_value_t = 1)]
    radius: usize,
    /// Clip the longitude window at the field edge instead of wrapping.
    #[arg(long)]
    bounded_x: bool,
    /// Clip the latitude window at the field edge instead of wrapping.
    #[arg(long)]
    bounded_y: bool,
    /// JSON run configuration; replaces --shape/--radius/--bounded-*.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OrderArg {
    Canonical,
    Elimination,
}

impl From<OrderArg> for PointOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Canonical => PointOrder::Canonical,
            OrderArg::Elimination => PointOrder::Elimination,
        }
    }
}

#[derive(Args, Debug)]
struct PredecessorArgs {
    #[command(flatten)]
    grid: GridArgs,
    /// Print the predecessor indices of one point given as l,v,k,m.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    point: Option<Vec<i64>>,
    #[arg(long, value_enum, default_value_t = OrderArg::Canonical)]
    order: OrderArg,
}

#[derive(Args, Debug)]
struct EstimateArgs {
    /// Headerless CSV, one sample per row, features in elimination order.
    ensemble: PathBuf,
    #[command(flatten)]
    grid: GridArgs,
    #[arg(long)]
    alpha: Option<f64>,
    #[arg(long = "variance-floor")]
    variance_floor: Option<f64>,
    #[arg(long = "out-dir", default_value = ".")]
    out_dir: PathBuf,
    /// Also write the reconstructed precision matrix Tᵗ·D·T.
    #[arg(long)]
    precision: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Predecessors(args) => run_predecessors(args),
        Command::Estimate(args) => run_estimate(args),
    }
}

fn resolve_run_config(
    grid: &GridArgs,
    alpha: Option<f64>,
    variance_floor: Option<f64>,
) -> Result<RunConfig, String> {
    let mut cfg = if let Some(path) = &grid.config {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        serde_json::from_str::<RunConfig>(&text)
            .map_err(|e| format!("invalid config '{}': {e}", path.display()))?
    } else {
        RunConfig {
            shape: FieldShape::from_dims(&grid.shape).map_err(|e| e.to_string())?,
            stencil: StencilConfig {
                radius: grid.radius,
                x_periodic: !grid.bounded_x,
                y_periodic: !grid.bounded_y,
            },
            estimator: EstimatorConfig::default(),
        }
    };
    if let Some(alpha) = alpha {
        cfg.estimator.alpha = alpha;
    }
    if variance_floor.is_some() {
        cfg.estimator.variance_floor = variance_floor;
    }
    Ok(cfg)
}

fn run_predecessors(args: PredecessorArgs) -> Result<(), String> {
    let cfg = resolve_run_config(&args.grid, None, None)?;
    let stencil = cfg.stencil.stencil().map_err(|e| e.to_string())?;
    let shape = cfg.shape;
    let index = PredecessorIndex::new(shape);
    let order = PointOrder::from(args.order);

    if let Some(coords) = args.point {
        let point = GridPoint::try_from(coords.as_slice()).map_err(|e| e.to_string())?;
        let canonical = index.get_point_predecessors(point, &stencil);
        let indices: Vec<usize> = match order {
            PointOrder::Canonical => canonical,
            PointOrder::Elimination => canonical
                .into_iter()
                .filter_map(|p| PointOrder::Canonical.cell(&shape, p))
                .map(|cell| PointOrder::Elimination.index(&shape, cell))
                .collect(),
        };
        println!("{} predecessors", indices.len());
        let line = indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!("{line}");
        return Ok(());
    }

    let lists = index.get_all_predecessors(&stencil);
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["layer", "variable", "cells", "min", "max", "mean"]);
    let per_slab = shape.latitudes() * shape.longitudes();
    for (slab, chunk) in lists.chunks(per_slab).enumerate() {
        let counts: Vec<usize> = chunk.iter().map(Vec::len).collect();
        let min = counts.iter().copied().min().unwrap_or(0);
        let max = counts.iter().copied().max().unwrap_or(0);
        let mean = counts.iter().sum::<usize>() as f64 / counts.len().max(1) as f64;
        table.add_row(Row::from(vec![
            Cell::new(slab / shape.variables()),
            Cell::new(slab % shape.variables()),
            Cell::new(counts.len()),
            Cell::new(min),
            Cell::new(max),
            Cell::new(format!("{mean:.2}")),
        ]));
    }
    let total: usize = lists.iter().map(Vec::len).sum();
    println!(
        "shape {:?}, radius {}, x {:?}, y {:?}: {} cells, {} predecessor links",
        shape.dims(),
        stencil.radius(),
        stencil.longitude(),
        stencil.latitude(),
        shape.len(),
        total
    );
    println!("{table}");
    Ok(())
}

fn run_estimate(args: EstimateArgs) -> Result<(), String> {
    let cfg = resolve_run_config(&args.grid, args.alpha, args.variance_floor)?;
    let stencil = cfg.stencil.stencil().map_err(|e| e.to_string())?;
    let ensemble = load_ensemble(&args.ensemble)?;
    if ensemble.ncols() != cfg.shape.len() {
        return Err(format!(
            "ensemble has {} columns but shape {:?} has {} cells",
            ensemble.ncols(),
            cfg.shape.dims(),
            cfg.shape.len()
        ));
    }

    let index = PredecessorIndex::new(cfg.shape);
    let predecessors = index
        .ordered_predecessors(&stencil)
        .map_err(|e| e.to_string())?;
    let estimator =
        PrecisionEstimator::new(&ensemble, &predecessors, cfg.shape.len(), cfg.estimator)
            .map_err(|e| e.to_string())?;
    let (t, d) = estimator.decomposition();

    fs::create_dir_all(&args.out_dir)
        .map_err(|e| format!("failed to create '{}': {e}", args.out_dir.display()))?;
    write_triplets(&args.out_dir.join("T.csv"), &t.to_triplets())?;
    write_triplets(&args.out_dir.join("D.csv"), &d.to_triplets())?;
    if args.precision {
        let binv = estimator.precision_matrix().map_err(|e| e.to_string())?;
        write_triplets(&args.out_dir.join("Binv.csv"), &binv.to_triplets())?;
    }

    let diag = d.diagonal();
    let d_min = diag.iter().copied().fold(f64::INFINITY, f64::min);
    let d_max = diag.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["quantity", "value"]);
    for (name, value) in [
        ("samples", ensemble.nrows().to_string()),
        ("features", estimator.n_features().to_string()),
        ("alpha", format!("{:.3e}", cfg.estimator.alpha)),
        ("nnz(T)", t.nnz().to_string()),
        ("min D", format!("{d_min:.6e}")),
        ("max D", format!("{d_max:.6e}")),
    ] {
        table.add_row(Row::from(vec![Cell::new(name), Cell::new(value)]));
    }
    println!("{table}");
    println!("wrote factors to {}", args.out_dir.display());
    Ok(())
}

fn load_ensemble(path: &Path) -> Result<Array2<f64>, String> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| format!("failed to open csv '{}': {e}", path.display()))?;

    let mut width = None;
    let mut values = Vec::new();
    let mut rows = 0usize;
    for rec in rdr.records() {
        let record = rec.map_err(|e| format!("failed reading csv row: {e}"))?;
        let expected = *width.get_or_insert(record.len());
        if record.len() != expected {
            return Err(format!(
                "csv row width mismatch at row {}: got {} fields, expected {expected}",
                rows + 1,
                record.len()
            ));
        }
        for (col, raw) in record.iter().enumerate() {
            let v = raw.trim().parse::<f64>().map_err(|e| {
                format!("non-numeric value '{raw}' at row {}, col {}: {e}", rows + 1, col + 1)
            })?;
            values.push(v);
        }
        rows += 1;
    }
    let cols = width.ok_or_else(|| "csv has no rows".to_string())?;
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| format!("failed to shape ensemble: {e}"))
}

fn write_triplets(path: &Path, coo: &CooTriplets) -> Result<(), String> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| format!("failed to create output csv '{}': {e}", path.display()))?;
    wtr.write_record(["row", "col", "value"])
        .map_err(|e| format!("failed to write csv header: {e}"))?;
    for (row, col, value) in coo.iter() {
        wtr.write_record([row.to_string(), col.to_string(), format!("{value:.12e}")])
            .map_err(|e| format!("failed to write csv row: {e}"))?;
    }
    wtr.flush()
        .map_err(|e| format!("failed to flush '{}': {e}", path.display()))
}

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lumpsim::parser::IntegrationMethod;
use lumpsim::*;

const RC_NETLIST: &str = r#"
Simple RC Circuit
V1 1 0 DC 5V AC 1
R1 1 2 1k
C1 2 0 1n
.tran 1ns 100ns
.ac dec 10 1k 1g
.end
"#;

fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");
    let parser = SpiceParser::new();

    group.bench_function("parse_netlist", |b| {
        b.iter(|| parser.parse_netlist(RC_NETLIST).unwrap());
    });

    group.finish();
}

fn bench_matrix_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix_solver");

    for size in [10, 50, 100, 200].iter() {
        group.bench_with_input(BenchmarkId::new("lu_solver", size), size, |b, &size| {
            use nalgebra::{DMatrix, DVector};

            // Tridiagonal, like a resistor ladder
            let mut matrix = DMatrix::<f64>::identity(size, size);
            for i in 0..size {
                matrix[(i, i)] = 2.0;
                if i > 0 {
                    matrix[(i, i - 1)] = -1.0;
                    matrix[(i - 1, i)] = -1.0;
                }
            }

            let rhs = DVector::from_element(size, 1.0);
            let solver = LinearSolver::new();

            b.iter(|| solver.linear_solver(&matrix, &rhs).unwrap());
        });
    }

    group.finish();
}

fn bench_transient_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("transient_analysis");
    let netlist = SpiceParser::new().parse_netlist(RC_NETLIST).unwrap();

    for method in [IntegrationMethod::Explicit, IntegrationMethod::Implicit] {
        group.bench_with_input(BenchmarkId::new("transient_100_steps", method), &method, |b, &method| {
            b.iter(|| {
                let mut simulator = Simulator::new();
                simulator.load_netlist_from_parsed(netlist.clone()).unwrap();
                simulator.run_transient_analysis(1e-9, 100e-9, method).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_ac_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("ac_analysis");
    let circuit = SpiceParser::new().parse_netlist(RC_NETLIST).unwrap().to_circuit().unwrap();
    let frequencies: Vec<f64> = (0..61).map(|k| 10f64.powf(3.0 + k as f64 / 10.0)).collect();

    for kind in [ToolkitKind::Dense, ToolkitKind::Sparse] {
        group.bench_with_input(BenchmarkId::new("sweep_61_points", kind), &kind, |b, &kind| {
            let options = AnalysisOptions::default().with_toolkit(kind.build());
            let ac = Ac::new(&circuit, options).unwrap();
            b.iter(|| ac.solve(&frequencies).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_parsing,
    bench_matrix_sizes,
    bench_transient_analysis,
    bench_ac_analysis
);
criterion_main!(benches);

//! Integration test: distributed runs reproduce the single-process
//! convolution byte for byte, over both transports.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::thread;

use halo_cluster::{LeaderJob, LeaderListener, Role, TcpCommunicator, run, run_local};
use halo_pipeline::{Dimensions, FilterMatrix, PixelBuffer, convolve};

/// Deterministic, non-uniform test pattern.
fn pattern(dims: Dimensions) -> Vec<u8> {
    (0..dims.byte_len().unwrap())
        .map(|i| u8::try_from((i * 37 + i / 7 * 11) % 256).unwrap())
        .collect()
}

fn serial(dims: Dimensions, image: &[u8], filter: &str) -> Vec<u8> {
    let img = PixelBuffer::decode_from_bytes(image, dims).unwrap();
    let filter: FilterMatrix = filter.parse().unwrap();
    convolve(&img, &filter).unwrap().into_bytes()
}

fn distributed(dims: Dimensions, image: &[u8], filter: &str, workers: usize) -> Vec<u8> {
    let mut sink = Vec::new();
    let job = LeaderJob {
        dimensions: dims,
        image: Box::new(Cursor::new(image.to_vec())),
        filter: Box::new(filter.as_bytes()),
        output: Box::new(&mut sink),
    };
    let run = run_local(job, workers).expect("local run should succeed");
    assert_eq!(run.workers.len(), workers);
    assert_eq!(run.leader.output.as_ref().unwrap().as_bytes(), &sink[..]);
    sink
}

const FILTERS: &[&str] = &[
    "1",
    "1 1 1\n1 1 1\n1 1 1\n",
    "1 2 1\n2 4 2\n1 2 1\n",
    "0 -1 0\n-1 5 -1\n0 -1 0\n",
    "1 1 1 1 1\n1 2 2 2 1\n1 2 4 2 1\n1 2 2 2 1\n1 1 1 1 1\n",
    "0 0 0\n0 0 1\n0 0 0\n",
    "1 -1 0\n-1 1 0\n0 0 0\n",
];

#[test]
fn any_worker_count_matches_serial() {
    let dims = Dimensions::new(11, 13, 1);
    let image = pattern(dims);
    for filter in FILTERS {
        let expected = serial(dims, &image, filter);
        for workers in [1, 2, 3, 5, 8, 13, 20] {
            assert_eq!(
                distributed(dims, &image, filter, workers),
                expected,
                "filter {filter:?} over {workers} workers"
            );
        }
    }
}

#[test]
fn multi_channel_pixels_match_serial() {
    let dims = Dimensions::new(7, 9, 3);
    let image = pattern(dims);
    let filter = "1 2 1\n2 4 2\n1 2 1\n";
    let expected = serial(dims, &image, filter);
    for workers in [2, 4] {
        assert_eq!(distributed(dims, &image, filter, workers), expected);
    }
}

#[test]
fn uniform_box_blur_on_flat_image() {
    let dims = Dimensions::new(4, 4, 1);
    let out = distributed(dims, &[10; 16], "1 1 1\n1 1 1\n1 1 1\n", 2);
    #[rustfmt::skip]
    let expected = [
        4, 6, 6, 4,
        6, 10, 10, 6,
        6, 10, 10, 6,
        4, 6, 6, 4,
    ];
    assert_eq!(out, expected);
}

#[test]
fn filter_taller_than_bands() {
    // Radius 2 with one-row bands: every halo reaches past its
    // neighbours.
    let dims = Dimensions::new(5, 4, 1);
    let image = pattern(dims);
    let filter = "1 1 1 1 1\n1 1 1 1 1\n1 1 1 1 1\n1 1 1 1 1\n1 1 1 1 1\n";
    assert_eq!(
        distributed(dims, &image, filter, 4),
        serial(dims, &image, filter)
    );
}

#[test]
fn tcp_pool_writes_file_output() {
    let dims = Dimensions::new(9, 10, 1);
    let image = pattern(dims);
    let filter = "1 2 1\n2 4 2\n1 2 1\n";

    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("input.raw");
    let filter_path = dir.path().join("filter.txt");
    let output_path = dir.path().join("output.raw");
    std::fs::write(&image_path, &image).unwrap();
    std::fs::write(&filter_path, filter).unwrap();

    let listener = LeaderListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let workers: Vec<_> = (0..3)
        .map(|_| {
            thread::spawn(move || {
                let mut comm = TcpCommunicator::connect(addr).unwrap();
                run(Role::Worker, &mut comm).unwrap()
            })
        })
        .collect();

    let mut leader = listener.accept_workers(3).unwrap();
    let job = LeaderJob {
        dimensions: dims,
        image: Box::new(File::open(&image_path).unwrap()),
        filter: Box::new(BufReader::new(File::open(&filter_path).unwrap())),
        output: Box::new(File::create(&output_path).unwrap()),
    };
    let report = run(Role::Leader(job), &mut leader).unwrap();
    drop(leader);

    for worker in workers {
        let report = worker.join().unwrap();
        assert!(report.output.is_none());
        assert!(report.diagnostics.summary.bytes_received > 0);
    }

    let written = std::fs::read(&output_path).unwrap();
    assert_eq!(written, serial(dims, &image, filter));
    assert_eq!(report.output.unwrap().into_bytes(), written);
}

#[test]
fn invalid_filter_reported_by_leader() {
    let mut sink = Vec::new();
    let job = LeaderJob {
        dimensions: Dimensions::new(3, 3, 1),
        image: Box::new(Cursor::new(vec![0u8; 9])),
        filter: Box::new("1 1\n1 1\n".as_bytes()),
        output: Box::new(&mut sink),
    };
    let err = run_local(job, 2).unwrap_err();
    assert!(
        err.to_string().contains("invalid filter"),
        "unexpected error: {err}"
    );
}

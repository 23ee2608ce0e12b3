//! Integration tests for the ordered processing pipeline.

use vmdkraw_core::pipeline::{Pipeline, PipelineConfig};
use vmdkraw_core::Error;

#[test]
fn test_pipeline_processes_items() {
    let pipeline = Pipeline::default();
    let chunks: Vec<Vec<u8>> = vec![
        vec![1, 2, 3, 4],
        vec![5, 6, 7, 8],
        vec![9, 10, 11, 12],
        vec![13, 14, 15, 16],
    ];

    let results: Vec<u32> = pipeline
        .process(chunks, |_idx, data| Ok(data.iter().map(|&b| b as u32).sum()))
        .expect("Processing should succeed");

    assert_eq!(results, vec![10, 26, 42, 58]);
    assert!(!pipeline.is_parallel());
}

#[test]
fn test_parallel_processing_preserves_order() {
    let pipeline = Pipeline::new(PipelineConfig::new(4));
    assert!(pipeline.is_parallel());
    assert_eq!(pipeline.threads(), 4);

    let chunks: Vec<Vec<u8>> = (0..100).map(|i| vec![i as u8; 10]).collect();
    let results: Vec<u8> = pipeline
        .process(chunks, |idx, data| {
            assert_eq!(data[0], idx as u8, "Item should arrive with its own index");
            Ok(data[0])
        })
        .expect("Processing should succeed");

    assert_eq!(results.len(), 100);
    for (i, &val) in results.iter().enumerate() {
        assert_eq!(val, i as u8);
    }
}

#[test]
fn test_empty_input() {
    let pipeline = Pipeline::new(PipelineConfig::new(2));
    let results: Vec<u8> = pipeline
        .process(Vec::<Vec<u8>>::new(), |_idx, _data| Ok(0u8))
        .expect("Empty processing should succeed");
    assert!(results.is_empty());
}

#[test]
fn test_first_error_in_input_order() {
    let pipeline = Pipeline::new(PipelineConfig::new(4));
    let items: Vec<u64> = (0..64).collect();

    let err = pipeline
        .process(items, |idx, item| {
            if idx >= 10 {
                Err(Error::decompression(item, "intentional test error"))
            } else {
                Ok(item)
            }
        })
        .unwrap_err();

    assert!(matches!(err, Error::Decompression { offset: 10, .. }));
    assert!(err.to_string().contains("intentional test error"));
}

// src/pipeline.rs
//
// resolve model -> resolve tokenizer -> trace and export

use ndarray::{Array1, ArrayD, Axis};

use crate::error::RuntimeError;
use crate::onnx::{ExportSummary, ModelExporter, OnnxExporter};
use crate::resolver::{self, ArtifactSource, HubSource, ModelId};
use crate::settings::ExportSettings;
use crate::tokenizer::TokenizerWrapper;

/// Runs a full export with artifacts from the hub (or its cache) and the
/// ONNX exporter.
pub fn run_export(settings: &ExportSettings) -> Result<ExportSummary, RuntimeError> {
    settings.validate()?;
    let source = HubSource::new(settings.cache_dir.clone(), settings.offline)?;
    export_with(&source, &OnnxExporter, settings)
}

pub fn export_with(
    source: &dyn ArtifactSource,
    exporter: &dyn ModelExporter,
    settings: &ExportSettings,
) -> Result<ExportSummary, RuntimeError> {
    let model_id = ModelId::parse(&settings.model_id)?;
    let tokenizer_id = ModelId::parse(settings.tokenizer_id())?;

    let mut model = resolver::resolve_model(source, &model_id)?;
    let tokenizer = resolver::resolve_tokenizer(source, &tokenizer_id)?;
    resolver::warn_on_vocab_mismatch(&model, &tokenizer);

    model.eval();
    let input_ids = encode_dummy_input(&tokenizer, &settings.example_text)?;
    log::info!("dummy input {:?} from {:?}", input_ids.shape(), settings.example_text);

    let summary = exporter.export(&model, &input_ids, &settings.output_path, &settings.export_options())?;
    Ok(summary)
}

/// Encodes `text` with special tokens as an int64 `[1, n]` batch.
pub fn encode_dummy_input(tokenizer: &TokenizerWrapper, text: &str) -> Result<ArrayD<i64>, RuntimeError> {
    let ids: Vec<i64> = tokenizer.encode(text, true)?.into_iter().map(i64::from).collect();
    Ok(Array1::from(ids).insert_axis(Axis(0)).into_dyn())
}

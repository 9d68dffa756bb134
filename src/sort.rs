//! DICOM dataset curation: re-file loose instances into a normalized
//! `patient/date/series` hierarchy with deterministic file names.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{StandardDataDictionary, tags};
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::file::ReadPreamble;
use dicom::object::{DefaultDicomObject, FileDicomObject, FileMetaTableBuilder, OpenFileOptions};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use tracing::{debug, info};

use crate::report::{BatchArgs, FailWith, Failure, FailureKind, RunReport};
use crate::utils::{
    clean_text, decode_pixels, ensure_dir, progress_bar, validate_input_folder,
    walk_files_with_extension,
};

/// Placeholder for header fields that are absent or empty.
const MISSING_VALUE: &str = "NA";

/// CLI arguments for the `sort` subcommand.
#[derive(Args, Debug)]
pub struct SortArgs {
    /// Source folder containing scan folders with DICOM (.dcm) files
    #[arg(long = "in", short = 'i', env = "SPPIN_SORT_INPUT")]
    pub input: PathBuf,

    /// Destination root of the sorted dataset
    #[arg(long = "out", short = 'o', env = "SPPIN_SORT_OUTPUT")]
    pub output: PathBuf,

    /// Patient folder name, e.g. PT_86
    #[arg(long, conflicts_with = "patient_number")]
    pub patient_label: Option<String>,

    /// Prefix combined with --patient-number to form the patient folder name
    #[arg(long, default_value = "PT_")]
    pub patient_prefix: String,

    /// Operator-assigned patient counter
    #[arg(long)]
    pub patient_number: Option<u32>,

    /// Only descend into top-level scan folders whose name ends with this suffix (repeatable)
    #[arg(long = "scan-suffix")]
    pub scan_suffixes: Vec<String>,

    #[command(flatten)]
    pub batch: BatchArgs,
}

/// Explicit configuration for one re-filing run.
#[derive(Debug, Clone)]
pub struct SortConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub patient_label: String,
    pub scan_suffixes: Vec<String>,
}

impl SortArgs {
    pub fn to_config(&self) -> Result<SortConfig> {
        let patient_label = match (&self.patient_label, self.patient_number) {
            (Some(label), _) => label.clone(),
            (None, Some(number)) => format!("{}{number}", self.patient_prefix),
            (None, None) => anyhow::bail!("Either --patient-label or --patient-number is required"),
        };
        Ok(SortConfig {
            source: self.input.clone(),
            destination: self.output.clone(),
            patient_label,
            scan_suffixes: self.scan_suffixes.clone(),
        })
    }
}

/// Header fields that decide where an instance is filed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHeader {
    pub patient_id: String,
    pub study_date: String,
    pub series_description: String,
    pub modality: String,
    pub series_instance_uid: String,
    pub instance_number: String,
}

impl InstanceHeader {
    pub fn from_object(obj: &DefaultDicomObject) -> Self {
        Self {
            patient_id: clean_text(&header_value(obj, tags::PATIENT_ID, MISSING_VALUE)),
            study_date: clean_text(&header_value(obj, tags::STUDY_DATE, MISSING_VALUE)),
            series_description: clean_text(&header_value(
                obj,
                tags::SERIES_DESCRIPTION,
                MISSING_VALUE,
            )),
            modality: header_value(obj, tags::MODALITY, MISSING_VALUE),
            series_instance_uid: header_value(obj, tags::SERIES_INSTANCE_UID, MISSING_VALUE),
            instance_number: header_value(obj, tags::INSTANCE_NUMBER, "0"),
        }
    }

    /// `<Modality>.<SeriesInstanceUID>.<InstanceNumber>.dcm`
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}.{}.dcm",
            self.modality, self.series_instance_uid, self.instance_number
        )
    }

    /// `<patientLabel>/<studyDate>/<seriesDescription>`
    pub fn series_dir(&self, patient_label: &str) -> PathBuf {
        Path::new(patient_label)
            .join(&self.study_date)
            .join(&self.series_description)
    }
}

fn header_value(obj: &DefaultDicomObject, tag: Tag, default: &str) -> String {
    obj.element(tag)
        .ok()
        .and_then(|elem| elem.to_str().ok())
        .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Re-file all DICOM files of a dataset.
pub fn run(args: &SortArgs) -> Result<()> {
    validate_input_folder(&args.input)?;
    let config = args.to_config()?;
    let report = sort_dataset(&config, args.batch.quiet)?;
    report.finish(&args.batch)
}

/// Scan folders to walk: the source root itself, or its children whose
/// names end with one of the configured suffixes.
pub fn scan_folders(config: &SortConfig) -> Result<Vec<PathBuf>> {
    if config.scan_suffixes.is_empty() {
        return Ok(vec![config.source.clone()]);
    }
    let entries = fs::read_dir(&config.source)
        .with_context(|| format!("Failed to read input folder: {:?}", config.source))?;

    let mut folders: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| config.scan_suffixes.iter().any(|s| name.ends_with(s.as_str())))
        })
        .collect();
    folders.sort();
    Ok(folders)
}

pub fn sort_dataset(config: &SortConfig, quiet: bool) -> Result<RunReport> {
    let mut report = RunReport::new("sort");
    let folders = scan_folders(config)?;
    info!("Found {} scan folder(s) for patient {}", folders.len(), config.patient_label);

    for folder in folders {
        info!("Reading file list of {folder:?}...");
        let files = walk_files_with_extension(&folder, "dcm");
        info!("{} files found.", files.len());

        let pb = progress_bar(files.len(), quiet);
        for dicom_path in &files {
            let result = refile_instance(dicom_path, config).map(|filed| {
                if let Some(warning) = filed.decompress_warning {
                    report.warn(dicom_path, warning);
                }
                filed.path
            });
            report.record(dicom_path, result);
            pb.inc(1);
        }
        pb.finish_and_clear();
    }

    Ok(report)
}

/// Where an instance ended up and whether it is still compressed.
#[derive(Debug)]
pub struct Filed {
    pub path: PathBuf,
    pub decompress_warning: Option<String>,
}

/// Read one instance, decompress it when possible, and save it under the
/// destination hierarchy.
pub fn refile_instance(dicom_path: &Path, config: &SortConfig) -> Result<Filed, Failure> {
    let obj = OpenFileOptions::new()
        .read_preamble(ReadPreamble::Auto)
        .open_file(dicom_path)
        .with_context(|| format!("Failed to open DICOM file: {dicom_path:?}"))
        .fail_with(FailureKind::Read)?;

    let header = InstanceHeader::from_object(&obj);

    let (obj, decompress_warning) = match decompressed(&obj) {
        Ok(Some(native)) => (native, None),
        Ok(None) => (obj, None),
        Err(e) => (
            obj,
            Some(format!(
                "an instance in {} - {} - {} could not be decompressed: {e:#}",
                header.patient_id, header.study_date, header.series_description
            )),
        ),
    };

    let save_dir = config
        .destination
        .join(header.series_dir(&config.patient_label));
    if ensure_dir(&save_dir).fail_with(FailureKind::Write)? {
        info!(
            "Saving out file: {} - {} - {}.",
            config.patient_label, header.study_date, header.series_description
        );
    }

    let save_path = save_dir.join(header.file_name());
    obj.write_to_file(&save_path)
        .with_context(|| format!("Failed to write DICOM file: {save_path:?}"))
        .fail_with(FailureKind::Write)?;
    debug!("{dicom_path:?} -> {save_path:?}");

    Ok(Filed {
        path: save_path,
        decompress_warning,
    })
}

/// Decode encapsulated pixel data into a native Explicit VR Little Endian
/// object. Returns `None` when the object is already native or has no pixels.
pub fn decompressed(obj: &DefaultDicomObject) -> Result<Option<DefaultDicomObject>> {
    let encapsulated = TransferSyntaxRegistry
        .get(obj.meta().transfer_syntax())
        .is_some_and(|ts| ts.is_encapsulated_pixel_data());
    if !encapsulated || obj.element(tags::PIXEL_DATA).is_err() {
        return Ok(None);
    }

    let decoded = decode_pixels(obj)?;
    let pixel_bytes = decoded.data().to_vec();
    let bits_allocated = decoded.bits_allocated();
    let samples_per_pixel = decoded.samples_per_pixel();
    drop(decoded);

    let mut dataset = obj.clone().into_inner();
    let vr = if bits_allocated > 8 { VR::OW } else { VR::OB };
    dataset.put(DataElement::new(
        tags::PIXEL_DATA,
        vr,
        PrimitiveValue::from(pixel_bytes),
    ));
    if samples_per_pixel == 3 {
        // Decoders hand back interleaved RGB regardless of the stored colour model.
        dataset.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("RGB"),
        ));
        dataset.put(DataElement::new(
            tags::PLANAR_CONFIGURATION,
            VR::US,
            PrimitiveValue::from(0_u16),
        ));
    }

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid(obj.meta().media_storage_sop_class_uid())
        .media_storage_sop_instance_uid(obj.meta().media_storage_sop_instance_uid())
        .build()?;

    let mut native = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in dataset {
        native.put(elem);
    }
    Ok(Some(native))
}

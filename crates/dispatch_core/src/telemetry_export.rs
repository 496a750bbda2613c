//! Parquet export of collected telemetry.

use std::error::Error;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, UInt64Array, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use crate::telemetry::{InterruptionNotice, InterruptionReason, SimTelemetry};

pub fn write_completed_rides_parquet<P: AsRef<Path>>(
    path: P,
    telemetry: &SimTelemetry,
) -> Result<(), Box<dyn Error>> {
    let rides = &telemetry.completed_rides;
    let mut traveler = Vec::with_capacity(rides.len());
    let mut vehicle = Vec::with_capacity(rides.len());
    let mut requested_at = Vec::with_capacity(rides.len());
    let mut matched_at = Vec::with_capacity(rides.len());
    let mut pickup_at = Vec::with_capacity(rides.len());
    let mut completed_at = Vec::with_capacity(rides.len());
    let mut direct_m = Vec::with_capacity(rides.len());
    let mut ridden_m = Vec::with_capacity(rides.len());

    for record in rides {
        traveler.push(record.traveler.to_bits());
        vehicle.push(record.vehicle.to_bits());
        requested_at.push(record.requested_at);
        matched_at.push(record.matched_at);
        pickup_at.push(record.pickup_at);
        completed_at.push(record.completed_at);
        direct_m.push(record.direct_m);
        ridden_m.push(record.ridden_m);
    }

    let schema = Schema::new(vec![
        Field::new("traveler", DataType::UInt64, false),
        Field::new("vehicle", DataType::UInt64, false),
        Field::new("requested_at", DataType::UInt64, false),
        Field::new("matched_at", DataType::UInt64, false),
        Field::new("pickup_at", DataType::UInt64, false),
        Field::new("completed_at", DataType::UInt64, false),
        Field::new("direct_m", DataType::Float64, false),
        Field::new("ridden_m", DataType::Float64, false),
    ]);

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(traveler)),
        Arc::new(UInt64Array::from(vehicle)),
        Arc::new(UInt64Array::from(requested_at)),
        Arc::new(UInt64Array::from(matched_at)),
        Arc::new(UInt64Array::from(pickup_at)),
        Arc::new(UInt64Array::from(completed_at)),
        Arc::new(Float64Array::from(direct_m)),
        Arc::new(Float64Array::from(ridden_m)),
    ];

    write_record_batch(path, schema, arrays)
}

/// Export interruption notices drained from the outbox.
pub fn write_interruptions_parquet<P: AsRef<Path>>(
    path: P,
    notices: &[InterruptionNotice],
) -> Result<(), Box<dyn Error>> {
    let mut at_ms = Vec::with_capacity(notices.len());
    let mut traveler = Vec::with_capacity(notices.len());
    let mut vehicle = Vec::with_capacity(notices.len());
    let mut reason = Vec::with_capacity(notices.len());

    for notice in notices {
        at_ms.push(notice.at_ms);
        traveler.push(notice.traveler.to_bits());
        vehicle.push(notice.vehicle.map_or(0, |v| v.to_bits()));
        reason.push(reason_code(notice.reason));
    }

    let schema = Schema::new(vec![
        Field::new("at_ms", DataType::UInt64, false),
        Field::new("traveler", DataType::UInt64, false),
        Field::new("vehicle", DataType::UInt64, false),
        Field::new("reason", DataType::UInt8, false),
    ]);

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(at_ms)),
        Arc::new(UInt64Array::from(traveler)),
        Arc::new(UInt64Array::from(vehicle)),
        Arc::new(UInt8Array::from(reason)),
    ];

    write_record_batch(path, schema, arrays)
}

fn write_record_batch<P: AsRef<Path>>(
    path: P,
    schema: Schema,
    arrays: Vec<ArrayRef>,
) -> Result<(), Box<dyn Error>> {
    let schema = Arc::new(schema);
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn reason_code(reason: InterruptionReason) -> u8 {
    match reason {
        InterruptionReason::RouteLost => 0,
        InterruptionReason::MatchCancelled => 1,
        InterruptionReason::DropoffChanged => 2,
    }
}

#[cfg(test)]
mod tests {
    use bevy_ecs::prelude::Entity;

    use super::*;
    use crate::telemetry::CompletedRideRecord;

    #[test]
    fn completed_rides_export_writes_a_parquet_file() {
        let mut telemetry = SimTelemetry::default();
        telemetry.record_ride(CompletedRideRecord {
            traveler: Entity::from_raw(1),
            vehicle: Entity::from_raw(2),
            requested_at: 0,
            matched_at: 2_000,
            pickup_at: 9_000,
            completed_at: 61_000,
            direct_m: 1_200.0,
            ridden_m: 1_450.0,
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("completed_rides.parquet");
        write_completed_rides_parquet(&path, &telemetry).expect("export");
        let meta = std::fs::metadata(&path).expect("file exists");
        assert!(meta.len() > 0);
    }

    #[test]
    fn interruption_export_handles_missing_vehicle() {
        let notices = [InterruptionNotice {
            at_ms: 42,
            traveler: Entity::from_raw(7),
            vehicle: None,
            reason: InterruptionReason::RouteLost,
        }];

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("interruptions.parquet");
        write_interruptions_parquet(&path, &notices).expect("export");
        assert!(std::fs::metadata(&path).expect("file exists").len() > 0);
    }
}

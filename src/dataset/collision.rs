use super::{Insert, Value};
use crate::formats::RawRecord;
use crate::formats::coerce::{clock_time, integer, numeric, us_date};

pub(super) const FIELD_COUNT: usize = 29;

const COLLISION_ID: usize = 23;

fn text(record: &RawRecord, index: usize) -> Value {
    Value::Text(record.field(index).to_string())
}

fn int(record: &RawRecord, index: usize) -> Value {
    Value::Int(integer(record.field(index)))
}

pub(super) fn transform(record: &RawRecord) -> Vec<Insert> {
    let id = int(record, COLLISION_ID);

    let mut vehicles_factors = Vec::with_capacity(11);
    vehicles_factors.push(id.clone());
    // Vehicle type codes 1-5, then contributing factors 1-5
    vehicles_factors.extend((24..29).map(|i| text(record, i)));
    vehicles_factors.extend((18..23).map(|i| text(record, i)));

    vec![
        Insert::new(
            "Crash",
            vec![
                id.clone(),
                Value::Date(us_date(record.field(0))),
                Value::Time(clock_time(record.field(1))),
            ],
        ),
        Insert::new(
            "Location",
            vec![
                id.clone(),
                text(record, 2),
                text(record, 3),
                Value::Float(numeric(record.field(4))),
                Value::Float(numeric(record.field(5))),
                text(record, 7),
                text(record, 8),
                text(record, 9),
            ],
        ),
        Insert::new(
            "Injuries",
            vec![
                id.clone(),
                int(record, 10),
                int(record, 12),
                int(record, 14),
                int(record, 16),
            ],
        ),
        Insert::new(
            "Deaths",
            vec![
                id,
                int(record, 11),
                int(record, 13),
                int(record, 15),
                int(record, 17),
            ],
        ),
        Insert::new("VehiclesFactors", vehicles_factors),
    ]
}

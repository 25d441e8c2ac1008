use super::{Insert, Value};
use crate::formats::RawRecord;
use crate::formats::coerce::{flag, integer, iso_date, numeric};

pub(super) const FIELD_COUNT: usize = 24;

/// Columns 11..24 are the weather-type indicators (WT01, WT02, ...)
const WEATHER_TYPES: std::ops::Range<usize> = 11..24;

pub(super) fn transform(record: &RawRecord) -> Vec<Insert> {
    let station = Value::Text(record.field(0).to_string());
    let date = Value::Date(iso_date(record.field(1)));

    let mut weather_types = Vec::with_capacity(1 + WEATHER_TYPES.len());
    weather_types.push(date.clone());
    weather_types.extend(WEATHER_TYPES.map(|i| Value::Flag(flag(record.field(i)))));

    vec![
        Insert::new("Weather", vec![station, date.clone()]),
        Insert::new(
            "Wind",
            vec![date.clone(), Value::Float(numeric(record.field(2)))],
        ),
        Insert::new(
            "Precipitation",
            vec![
                date.clone(),
                Value::Float(numeric(record.field(4))),
                Value::Float(numeric(record.field(5))),
                Value::Float(numeric(record.field(6))),
            ],
        ),
        Insert::new(
            "Temperature",
            vec![
                date,
                Value::Int(integer(record.field(8))),
                Value::Int(integer(record.field(9))),
            ],
        ),
        Insert::new("Wtypes", weather_types),
    ]
}

use serde::{
    de::MapAccess,
    de::Visitor,
    de::{self, IntoDeserializer},
    Deserialize, Deserializer,
};
use std::{fmt, marker::PhantomData, str::FromStr};

// Adapted from https://serde.rs/string-or-struct.html

#[derive(Debug)]
pub enum Void {}

/// Deserialize either a plain string (through `T`'s `FromStr`) or a full map.
pub fn string_or_struct<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct StringOrStruct<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrStruct<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or map")
        }

        fn visit_str<E>(self, value: &str) -> Result<T, E>
        where
            E: de::Error,
        {
            match FromStr::from_str(value) {
                Ok(v) => Ok(v),
                Err(void) => match void {},
            }
        }

        fn visit_map<M>(self, map: M) -> Result<T, M::Error>
        where
            M: MapAccess<'de>,
        {
            Deserialize::deserialize(de::value::MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(StringOrStruct(PhantomData))
}

/// Deserialize a single item or an array, like `"RUN make"` or
/// `["RUN make", "RUN make install"]`.
pub fn single_or_array<'de, TArr, TItem, D>(deserializer: D) -> Result<TArr, D::Error>
where
    TArr: Deserialize<'de> + Default + Extend<TItem>,
    TItem: Deserialize<'de>,
    D: Deserializer<'de>,
{
    fn create_t_arr<TArr, TItem>(item: TItem) -> TArr
    where
        TArr: Default + Extend<TItem>,
    {
        let mut arr = TArr::default();
        arr.extend([item]);
        arr
    }

    struct SingleOrArray<TArr, TItem>(PhantomData<fn() -> (TArr, TItem)>);

    impl<'de, TArr, TItem> Visitor<'de> for SingleOrArray<TArr, TItem>
    where
        TArr: Deserialize<'de> + Default + Extend<TItem>,
        TItem: Deserialize<'de>,
    {
        type Value = TArr;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("A single item or an array of items")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(create_t_arr(Deserialize::deserialize(v.into_deserializer())?))
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(create_t_arr(Deserialize::deserialize(v.into_deserializer())?))
        }

        fn visit_seq<A>(self, seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            TArr::deserialize(serde::de::value::SeqAccessDeserializer::new(seq))
        }

        fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            Ok(create_t_arr(Deserialize::deserialize(
                serde::de::value::MapAccessDeserializer::new(map),
            )?))
        }
    }

    deserializer.deserialize_any(SingleOrArray(PhantomData))
}

/// `single_or_array` specialized to a list of strings, for use with
/// `#[serde(deserialize_with)]`.
pub fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    single_or_array::<Vec<String>, String, D>(deserializer)
}

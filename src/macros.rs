/// Build the name → value map taken by the execute operations.
///
/// ```rust
/// use sproc_middleware::{RowValues, params};
///
/// let values = params! { "Name" => "X", "Value" => 999 };
/// assert_eq!(values.get("Value"), Some(&RowValues::Int(999)));
/// assert!(params! {}.is_empty());
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::collections::HashMap::<::std::string::String, $crate::RowValues>::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut values =
            ::std::collections::HashMap::<::std::string::String, $crate::RowValues>::new();
        $(
            values.insert(::std::string::String::from($name), $crate::RowValues::from($value));
        )+
        values
    }};
}

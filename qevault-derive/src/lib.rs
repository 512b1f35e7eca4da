//! Derive macros for `qevault`.
//!
//! `#[derive(EncryptedFields)]` turns annotated struct fields into the field
//! declarations an encrypted field map is built from.

#![warn(clippy::pedantic, clippy::nursery)]

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Field, Fields, LitStr, Type};

/// Derive macro implementing `qevault::field_map::EncryptedFields`.
///
/// Only fields carrying `#[encrypted(...)]` are declared. Supported keys:
///
/// - `key_alt_name` (required): alt-name of the data key
/// - `bson_type`: declared type; inferred for `String`, `bool`, `i32`,
///   `i64`, `f64` and `Vec<_>` when omitted
/// - `queries = "equality"`: make the field equality-queryable
/// - `path`: document path, defaults to the field name
///
/// # Example
///
/// ```rust,ignore
/// use qevault_derive::EncryptedFields;
///
/// #[derive(EncryptedFields)]
/// struct Memory {
///     #[encrypted(key_alt_name = "k1", queries = "equality")]
///     email: String,
///     #[encrypted(key_alt_name = "k2")]
///     memory: String,
///     created_by: String,
/// }
/// ```
#[proc_macro_derive(EncryptedFields, attributes(encrypted))]
pub fn derive_encrypted_fields(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input).unwrap_or_else(syn::Error::into_compile_error).into()
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "EncryptedFields can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "EncryptedFields requires named fields",
        ));
    };

    let mut declarations = Vec::new();
    for field in &fields.named {
        if let Some(declaration) = declaration(field)? {
            declarations.push(declaration);
        }
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics ::qevault::field_map::EncryptedFields
            for #name #ty_generics #where_clause
        {
            fn field_declarations() -> ::std::vec::Vec<::qevault::field_map::FieldDeclaration> {
                ::std::vec![#(#declarations),*]
            }
        }
    })
}

fn declaration(field: &Field) -> syn::Result<Option<TokenStream2>> {
    let Some(attr) = field.attrs.iter().find(|a| a.path().is_ident("encrypted")) else {
        return Ok(None);
    };

    let mut path = None;
    let mut bson_type = None;
    let mut key_alt_name = None;
    let mut equality = false;

    attr.parse_nested_meta(|meta| {
        let value: LitStr = meta.value()?.parse()?;
        if meta.path.is_ident("path") {
            path = Some(value.value());
        } else if meta.path.is_ident("bson_type") {
            bson_type = Some(bson_variant(&value.value(), value.span())?);
        } else if meta.path.is_ident("key_alt_name") {
            key_alt_name = Some(value.value());
        } else if meta.path.is_ident("queries") {
            if value.value() != "equality" {
                return Err(syn::Error::new(value.span(), "only `equality` queries are supported"));
            }
            equality = true;
        } else {
            return Err(meta.error("expected `path`, `bson_type`, `key_alt_name` or `queries`"));
        }
        Ok(())
    })?;

    let key_alt_name = key_alt_name
        .ok_or_else(|| syn::Error::new_spanned(attr, "missing `key_alt_name`"))?;
    let path = match (path, &field.ident) {
        (Some(path), _) => path,
        (None, Some(ident)) => ident.to_string(),
        (None, None) => return Err(syn::Error::new_spanned(field, "field has no name")),
    };
    let bson_type = match bson_type.or_else(|| infer_bson_type(&field.ty)) {
        Some(variant) => variant,
        None => {
            return Err(syn::Error::new_spanned(
                &field.ty,
                "cannot infer `bson_type` for this type; set it explicitly",
            ))
        }
    };

    let variant = syn::Ident::new(bson_type, Span::call_site());
    let queries = equality.then(|| {
        quote! { .with_queries(::qevault::field_map::QueryType::Equality) }
    });
    Ok(Some(quote! {
        ::qevault::field_map::FieldDeclaration::new(
            #path,
            ::qevault::field_map::BsonType::#variant,
            #key_alt_name,
        )#queries
    }))
}

fn bson_variant(name: &str, span: Span) -> syn::Result<&'static str> {
    Ok(match name {
        "string" => "String",
        "object" => "Object",
        "int" => "Int",
        "long" => "Long",
        "double" => "Double",
        "bool" => "Bool",
        "date" => "Date",
        "binData" => "BinData",
        "array" => "Array",
        "decimal" => "Decimal",
        other => return Err(syn::Error::new(span, format!("unknown bson_type `{other}`"))),
    })
}

fn infer_bson_type(ty: &Type) -> Option<&'static str> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let last = type_path.path.segments.last()?;
    Some(match last.ident.to_string().as_str() {
        "String" => "String",
        "bool" => "Bool",
        "i32" => "Int",
        "i64" => "Long",
        "f64" => "Double",
        "Vec" => "Array",
        _ => return None,
    })
}

// Hotel details come back as the supplier's AvailRS XML document. Only the
// parts needed to build rates are mapped.

use quick_xml::de::from_str;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use super::{SupplierError, SupplierRate};

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
#[serde(rename = "AvailRS")]
struct XmlAvailResponse {
    hotels: XmlHotels,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlHotels {
    #[serde(rename = "Hotel")]
    hotels: Vec<XmlHotel>,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlHotel {
    #[serde(rename = "@code")]
    hotel_id: String,
    meal_plans: XmlMealPlans,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlMealPlans {
    #[serde(rename = "MealPlan")]
    meal_plans: Vec<XmlMealPlan>,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlMealPlan {
    #[serde(rename = "@code")]
    code: String,
    options: XmlOptions,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlOptions {
    #[serde(rename = "Option")]
    options: Vec<XmlOption>,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlOption {
    #[serde(rename = "@status")]
    status: String,
    price: XmlPrice,
    rooms: XmlRooms,
    parameters: XmlParameters,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlPrice {
    #[serde(rename = "@currency")]
    currency: String,
    #[serde(rename = "@amount")]
    amount: String,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlRooms {
    #[serde(rename = "Room")]
    rooms: Vec<XmlRoom>,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlRoom {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@code")]
    code: String,
    #[serde(rename = "@description")]
    description: String,
    #[serde(rename = "@nonRefundable")]
    non_refundable: String,
    price: XmlPrice,
    cancel_penalties: XmlCancelPenalties,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlCancelPenalties {
    #[serde(rename = "CancelPenalty")]
    cancel_penalties: Vec<XmlCancelPenalty>,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlCancelPenalty {
    deadline: String,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlParameters {
    #[serde(rename = "Parameter")]
    parameters: Vec<XmlParameter>,
}

#[derive(Debug, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct XmlParameter {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "@value")]
    value: String,
}

// Flatten the meal plan / option / room tree into one rate per bookable room.
// Options not in status OK are not bookable and are dropped.
pub fn parse_rates(xml: &str, hotel_id: &str) -> Result<Vec<SupplierRate>, SupplierError> {
    let response: XmlAvailResponse =
        from_str(xml).map_err(|e| SupplierError::InvalidResponse(e.to_string()))?;

    let mut rates = Vec::new();
    for hotel in response
        .hotels
        .hotels
        .into_iter()
        .filter(|h| h.hotel_id == hotel_id)
    {
        for meal_plan in hotel.meal_plans.meal_plans {
            for option in meal_plan.options.options {
                if !option.status.eq_ignore_ascii_case("OK") {
                    continue;
                }

                let token = option
                    .parameters
                    .parameters
                    .iter()
                    .find(|p| p.key == "search_token")
                    .map(|p| p.value.clone());

                for room in option.rooms.rooms {
                    let price = if room.price.amount.is_empty() {
                        &option.price
                    } else {
                        &room.price
                    };
                    let net_price = Decimal::from_str(price.amount.trim()).map_err(|e| {
                        SupplierError::InvalidResponse(format!(
                            "bad amount '{}' for room {}: {}",
                            price.amount, room.code, e
                        ))
                    })?;

                    let rate_key = match &token {
                        Some(token) => format!("{}#{}", token, room.id),
                        None => format!("{}|{}|{}", hotel.hotel_id, meal_plan.code, room.id),
                    };

                    rates.push(SupplierRate {
                        rate_key,
                        room_code: room.code.clone(),
                        room_name: room.description.clone(),
                        board_type: meal_plan.code.clone(),
                        net_price,
                        currency: price.currency.to_ascii_uppercase(),
                        refundable: !room.non_refundable.eq_ignore_ascii_case("true"),
                        cancellation_deadlines: room
                            .cancel_penalties
                            .cancel_penalties
                            .iter()
                            .map(|cp| cp.deadline.clone())
                            .collect(),
                    });
                }
            }
        }
    }

    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DETAILS_XML: &str = r#"
<AvailRS>
  <Hotels>
    <Hotel code="48211">
      <MealPlans>
        <MealPlan code="RO">
          <Options>
            <Option status="OK">
              <Price currency="GBP" amount="84.82"/>
              <Rooms>
                <Room id="1#ND1" code="ND1" description="ROOM, QUEEN BED" nonRefundable="false">
                  <Price currency="GBP" amount="84.82"/>
                  <CancelPenalties>
                    <CancelPenalty>
                      <Deadline>2025-06-10T10:00:00Z</Deadline>
                    </CancelPenalty>
                  </CancelPenalties>
                </Room>
              </Rooms>
              <Parameters>
                <Parameter key="search_token" value="48211|2025-06-11|2025-06-12|A|US|GBP"/>
              </Parameters>
            </Option>
            <Option status="RQ">
              <Price currency="GBP" amount="70.00"/>
              <Rooms>
                <Room id="1#ND2" code="ND2" description="ON REQUEST" nonRefundable="false">
                  <Price currency="GBP" amount="70.00"/>
                </Room>
              </Rooms>
            </Option>
          </Options>
        </MealPlan>
        <MealPlan code="BB">
          <Options>
            <Option status="OK">
              <Price currency="GBP" amount="99.10"/>
              <Rooms>
                <Room id="1#KB1" code="KB1" description="KING BED, BREAKFAST" nonRefundable="true">
                  <Price currency="GBP" amount="99.10"/>
                </Room>
              </Rooms>
            </Option>
          </Options>
        </MealPlan>
      </MealPlans>
    </Hotel>
  </Hotels>
</AvailRS>
"#;

    #[test]
    fn test_parse_rates_flattens_bookable_rooms() {
        let rates = parse_rates(SAMPLE_DETAILS_XML, "48211").unwrap();
        assert_eq!(rates.len(), 2);

        let room_only = &rates[0];
        assert_eq!(room_only.board_type, "RO");
        assert_eq!(room_only.room_code, "ND1");
        assert_eq!(room_only.net_price, Decimal::new(8482, 2));
        assert_eq!(room_only.currency, "GBP");
        assert!(room_only.refundable);
        assert_eq!(
            room_only.rate_key,
            "48211|2025-06-11|2025-06-12|A|US|GBP#1#ND1"
        );
        assert_eq!(room_only.cancellation_deadlines, vec!["2025-06-10T10:00:00Z"]);

        let breakfast = &rates[1];
        assert_eq!(breakfast.board_type, "BB");
        assert!(!breakfast.refundable);
        assert_eq!(breakfast.rate_key, "48211|BB|1#KB1");
    }

    #[test]
    fn test_parse_rates_ignores_other_hotels() {
        let rates = parse_rates(SAMPLE_DETAILS_XML, "111").unwrap();
        assert!(rates.is_empty());
    }

    #[test]
    fn test_parse_rates_rejects_bad_amount() {
        let xml = r#"<AvailRS><Hotels><Hotel code="1"><MealPlans><MealPlan code="RO"><Options>
            <Option status="OK"><Price currency="EUR" amount="abc"/><Rooms><Room id="r" code="r"><Price currency="EUR" amount="abc"/></Room></Rooms></Option>
            </Options></MealPlan></MealPlans></Hotel></Hotels></AvailRS>"#;
        assert!(matches!(
            parse_rates(xml, "1"),
            Err(SupplierError::InvalidResponse(_))
        ));
    }
}
